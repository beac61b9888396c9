//! rollcall-hw — Frame sources for the recognition pipeline.
//!
//! V4L2 camera capture with grayscale conversion, plus replay of a
//! directory of still images.

pub mod camera;
pub mod convert;
pub mod sequence;

pub use camera::{Camera, CameraError, CaptureSize, DeviceInfo};
pub use convert::PixelFormat;
pub use sequence::{ImageSequence, SequenceError};
