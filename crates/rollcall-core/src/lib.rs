//! rollcall-core — Face identification and attendance engine.
//!
//! Faces are localized with SCRFD and embedded with ArcFace (ONNX Runtime, CPU),
//! matched against a gallery of reference identities by Euclidean distance,
//! and turned into cooldown-deduplicated attendance events.

pub mod alignment;
pub mod attendance;
pub mod detector;
pub mod extractor;
pub mod frame;
pub mod gallery;
pub mod matcher;
pub mod paths;
pub mod pipeline;
pub mod recognizer;
pub mod types;

pub use attendance::{
    persist, AttendanceDeduplicator, AttendanceEvent, AttendanceRecord, AttendanceStore,
    MemoryAttendanceStore, Persisted,
};
pub use extractor::{ExtractorError, FaceExtractor, OnnxFaceExtractor};
pub use frame::{Frame, FrameError};
pub use gallery::{
    scan_directory, DescriptorStore, Gallery, GalleryError, ImageFileLoader, ReferenceImage,
    ReferenceImageLoader,
};
pub use matcher::{EuclideanMatcher, MatchError, MatchResult, Matcher, UNKNOWN_LABEL};
pub use paths::{default_data_dir, default_db_path, default_faces_dir, default_model_dir};
pub use pipeline::{
    run, DriverConfig, FaceAnnotation, FrameDriver, FrameOutcome, FrameSource, PipelineError,
    ProcessedFrame, RunEnd, RunSummary,
};
pub use types::{BoundingBox, Detection, Embedding, Identity};
