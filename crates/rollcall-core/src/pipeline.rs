//! Frame pipeline driver: skip → downsample → extract → match → dedup → annotate.

use crate::attendance::{persist, AttendanceDeduplicator, AttendanceEvent, AttendanceStore, Persisted};
use crate::extractor::{ExtractorError, FaceExtractor};
use crate::frame::Frame;
use crate::gallery::{DescriptorStore, Gallery};
use crate::matcher::{EuclideanMatcher, MatchError, Matcher, DEFAULT_MATCH_THRESHOLD};
use crate::types::BoundingBox;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

const BOX_VALUE: u8 = 255;
const KNOWN_STRIP_VALUE: u8 = 255;
const UNKNOWN_STRIP_VALUE: u8 = 64;
/// Height of the label strip along the bottom of a face box, in source pixels.
const LABEL_STRIP_HEIGHT: f32 = 35.0;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("frame source failed: {0}")]
    Source(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("extraction failed: {0}")]
    Extractor(#[from] ExtractorError),
    #[error("matching failed: {0}")]
    Match(#[from] MatchError),
    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),
}

/// A pull-based supply of frames.
///
/// `Ok(None)` is end of stream; `Err` is a device or decode failure. Both are
/// distinct from a valid frame that happens to contain no face.
pub trait FrameSource {
    type Error: std::error::Error + Send + Sync + 'static;

    fn next_frame(&mut self) -> Result<Option<Frame>, Self::Error>;

    /// Iterate frames until end of stream or the first error.
    fn frames(self) -> Frames<Self>
    where
        Self: Sized,
    {
        Frames {
            source: self,
            finished: false,
        }
    }
}

/// Iterator over a [`FrameSource`]. Fused after end of stream or an error.
pub struct Frames<S> {
    source: S,
    finished: bool,
}

impl<S: FrameSource> Iterator for Frames<S> {
    type Item = Result<Frame, S::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.source.next_frame() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Tunables for the per-frame driver.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriverConfig {
    /// Scale applied before detection, in (0, 1].
    pub downsample: f32,
    /// Process one frame out of every `process_every`; 1 processes all.
    pub process_every: u32,
    /// Euclidean match threshold.
    pub threshold: f32,
    /// Minimum confidence (percent) a match needs before it counts for attendance.
    pub min_confidence: f32,
    /// Outline thickness in source pixels.
    pub box_thickness: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            downsample: 0.5,
            process_every: 2,
            threshold: DEFAULT_MATCH_THRESHOLD,
            min_confidence: 0.0,
            box_thickness: 2,
        }
    }
}

impl DriverConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !(self.downsample > 0.0 && self.downsample <= 1.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "downsample factor must be in (0, 1], got {}",
                self.downsample
            )));
        }
        if self.process_every == 0 {
            return Err(PipelineError::InvalidConfig("process_every must be at least 1".into()));
        }
        if !(self.threshold > 0.0 && self.threshold.is_finite()) {
            return Err(PipelineError::InvalidConfig(format!(
                "match threshold must be positive, got {}",
                self.threshold
            )));
        }
        if !(0.0..=100.0).contains(&self.min_confidence) {
            return Err(PipelineError::InvalidConfig(format!(
                "min_confidence must be a percentage, got {}",
                self.min_confidence
            )));
        }
        Ok(())
    }
}

/// One face found in a processed frame, in source-frame coordinates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceAnnotation {
    pub region: BoundingBox,
    /// Matched label or "Unknown".
    pub label: String,
    pub known: bool,
    pub distance: Option<f32>,
    pub confidence: Option<f32>,
}

/// A frame that went through detection and matching.
#[derive(Debug, Clone)]
pub struct ProcessedFrame {
    /// The source frame with face boxes drawn in.
    pub frame: Frame,
    pub faces: Vec<FaceAnnotation>,
    /// Attendance events emitted while processing this frame.
    pub events: Vec<AttendanceEvent>,
    /// Version of the gallery snapshot the faces were matched against.
    pub gallery_version: u64,
}

#[derive(Debug, Clone)]
pub enum FrameOutcome {
    /// Dropped by the frame-skip ratio; returned untouched.
    Skipped(Frame),
    Processed(ProcessedFrame),
}

/// Runs one frame at a time through extraction, matching and deduplication.
///
/// The only state carried across frames is the skip counter.
pub struct FrameDriver<E, M = EuclideanMatcher> {
    extractor: E,
    matcher: M,
    config: DriverConfig,
    frames_seen: u64,
}

impl<E: FaceExtractor> FrameDriver<E, EuclideanMatcher> {
    pub fn new(extractor: E, config: DriverConfig) -> Result<Self, PipelineError> {
        Self::with_matcher(extractor, EuclideanMatcher, config)
    }
}

impl<E: FaceExtractor, M: Matcher> FrameDriver<E, M> {
    pub fn with_matcher(extractor: E, matcher: M, config: DriverConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            extractor,
            matcher,
            config,
            frames_seen: 0,
        })
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn extractor_mut(&mut self) -> &mut E {
        &mut self.extractor
    }

    /// Process one frame, or skip it according to the skip ratio.
    pub fn process(
        &mut self,
        frame: Frame,
        gallery: &Gallery,
        dedup: &mut AttendanceDeduplicator,
    ) -> Result<FrameOutcome, PipelineError> {
        self.frames_seen += 1;
        if self.frames_seen % u64::from(self.config.process_every) != 0 {
            return Ok(FrameOutcome::Skipped(frame));
        }
        self.process_now(frame, gallery, dedup).map(FrameOutcome::Processed)
    }

    /// Process a frame regardless of the skip ratio.
    pub fn process_now(
        &mut self,
        mut frame: Frame,
        gallery: &Gallery,
        dedup: &mut AttendanceDeduplicator,
    ) -> Result<ProcessedFrame, PipelineError> {
        let factor = self.config.downsample;
        let small = frame.downsample(factor);
        let detections = self.extractor.extract(&small)?;

        let mut faces = Vec::with_capacity(detections.len());
        let mut events = Vec::new();

        for detection in detections {
            let result = self
                .matcher
                .compare(&detection.embedding, gallery, self.config.threshold)?;

            if let Some(label) = result.label.as_deref() {
                let confident = result.confidence.unwrap_or(0.0) >= self.config.min_confidence;
                if confident {
                    if let Some(event) = dedup.record_if_due(label, frame.captured_at) {
                        tracing::info!(
                            label,
                            confidence = result.confidence,
                            sequence = frame.sequence,
                            "attendance event"
                        );
                        events.push(event);
                    }
                } else {
                    tracing::debug!(label, confidence = result.confidence, "match below confidence floor");
                }
            }

            let region = detection.region.scaled(1.0 / factor);
            annotate(&mut frame, &region, result.is_known(), self.config.box_thickness);
            faces.push(FaceAnnotation {
                region,
                label: result.display_label().to_string(),
                known: result.is_known(),
                distance: result.distance,
                confidence: result.confidence,
            });
        }

        tracing::trace!(sequence = frame.sequence, faces = faces.len(), "frame processed");
        Ok(ProcessedFrame {
            frame,
            faces,
            events,
            gallery_version: gallery.version(),
        })
    }
}

/// Outline the face and fill a label strip along its bottom edge.
fn annotate(frame: &mut Frame, region: &BoundingBox, known: bool, thickness: u32) {
    frame.draw_box(region, thickness, BOX_VALUE);
    let strip_height = LABEL_STRIP_HEIGHT.min(region.height);
    let strip = BoundingBox {
        x: region.x,
        y: region.bottom() - strip_height,
        width: region.width,
        height: strip_height,
        confidence: region.confidence,
        landmarks: None,
    };
    let value = if known { KNOWN_STRIP_VALUE } else { UNKNOWN_STRIP_VALUE };
    frame.fill_box(&strip, value);
}

/// Why a run ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunEnd {
    Stopped,
    EndOfStream,
}

/// Counters for one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub end: RunEnd,
    pub frames_read: u64,
    pub frames_processed: u64,
    pub faces: u64,
    pub recognized: u64,
    pub events: u64,
    pub written: u64,
    pub already_recorded: u64,
    pub write_failures: u64,
}

impl RunSummary {
    fn new() -> Self {
        Self {
            end: RunEnd::EndOfStream,
            frames_read: 0,
            frames_processed: 0,
            faces: 0,
            recognized: 0,
            events: 0,
            written: 0,
            already_recorded: 0,
            write_failures: 0,
        }
    }
}

/// Drive frames from `source` through `driver` until stopped, end of stream,
/// or a fatal error.
///
/// `source` is consumed and dropped on every exit path, releasing the device.
/// `stop` is checked once per iteration before the next frame is pulled.
/// Each processed frame's events are persisted; a failed write is logged and
/// counted but does not end the run.
pub fn run<E, M, S, A, F>(
    driver: &mut FrameDriver<E, M>,
    source: S,
    gallery: &DescriptorStore,
    dedup: &mut AttendanceDeduplicator,
    attendance: &mut A,
    stop: &AtomicBool,
    mut on_frame: F,
) -> Result<RunSummary, PipelineError>
where
    E: FaceExtractor,
    M: Matcher,
    S: FrameSource,
    A: AttendanceStore + ?Sized,
    F: FnMut(&ProcessedFrame),
{
    let mut summary = RunSummary::new();
    let mut frames = source.frames();

    loop {
        if stop.load(Ordering::Relaxed) {
            summary.end = RunEnd::Stopped;
            break;
        }

        let frame = match frames.next() {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                tracing::error!(error = %e, frames_read = summary.frames_read, "frame acquisition failed");
                return Err(PipelineError::Source(Box::new(e)));
            }
            None => {
                summary.end = RunEnd::EndOfStream;
                break;
            }
        };
        summary.frames_read += 1;

        let snapshot = gallery.snapshot();
        let processed = match driver.process(frame, &snapshot, dedup)? {
            FrameOutcome::Skipped(_) => continue,
            FrameOutcome::Processed(processed) => processed,
        };

        summary.frames_processed += 1;
        summary.faces += processed.faces.len() as u64;
        summary.recognized += processed.faces.iter().filter(|f| f.known).count() as u64;
        summary.events += processed.events.len() as u64;

        for event in &processed.events {
            match persist(attendance, &event.record()) {
                Ok(Persisted::Written) => summary.written += 1,
                Ok(Persisted::AlreadyRecorded) => summary.already_recorded += 1,
                Err(e) => {
                    summary.write_failures += 1;
                    tracing::warn!(label = event.label(), error = %e, "failed to persist attendance; continuing");
                }
            }
        }

        on_frame(&processed);
    }

    tracing::info!(
        end = ?summary.end,
        frames_read = summary.frames_read,
        frames_processed = summary.frames_processed,
        events = summary.events,
        "pipeline run finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Detection, Embedding, Identity};
    use chrono::{Local, TimeZone};

    /// Reports one face per frame at a fixed spot with a fixed embedding.
    struct FixedFace {
        embedding: Vec<f32>,
        seen_sizes: Vec<(u32, u32)>,
    }

    impl FaceExtractor for FixedFace {
        fn detect(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, ExtractorError> {
            self.seen_sizes.push((frame.width, frame.height));
            Ok(vec![BoundingBox {
                x: 10.0, y: 5.0, width: 20.0, height: 20.0,
                confidence: 0.99, landmarks: Some([(15.0, 10.0); 5]),
            }])
        }

        fn embed(&mut self, _frame: &Frame, regions: &[BoundingBox]) -> Result<Vec<Detection>, ExtractorError> {
            Ok(regions
                .iter()
                .map(|r| Detection { region: r.clone(), embedding: Embedding::new(self.embedding.clone()) })
                .collect())
        }
    }

    fn frame(seq: u32) -> Frame {
        Frame::new(vec![0u8; 160 * 120], 160, 120)
            .unwrap()
            .with_sequence(seq)
            .with_timestamp(Local.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap())
    }

    fn alice() -> Gallery {
        Gallery::from_identities(vec![Identity {
            label: "alice".into(),
            embedding: Embedding::new(vec![0.0, 0.0]),
        }])
        .unwrap()
    }

    fn driver(embedding: Vec<f32>, config: DriverConfig) -> FrameDriver<FixedFace> {
        FrameDriver::new(FixedFace { embedding, seen_sizes: Vec::new() }, config).unwrap()
    }

    #[test]
    fn test_config_validation() {
        assert!(DriverConfig::default().validate().is_ok());
        for bad in [
            DriverConfig { downsample: 0.0, ..Default::default() },
            DriverConfig { downsample: 1.5, ..Default::default() },
            DriverConfig { process_every: 0, ..Default::default() },
            DriverConfig { threshold: -1.0, ..Default::default() },
            DriverConfig { min_confidence: 101.0, ..Default::default() },
        ] {
            assert!(matches!(bad.validate(), Err(PipelineError::InvalidConfig(_))), "{bad:?}");
        }
    }

    #[test]
    fn test_skips_all_but_every_nth_frame() {
        let mut d = driver(vec![0.0, 0.0], DriverConfig { process_every: 3, ..Default::default() });
        let mut dedup = AttendanceDeduplicator::default();
        let processed: Vec<u32> = (1..=9)
            .filter_map(|seq| match d.process(frame(seq), &alice(), &mut dedup).unwrap() {
                FrameOutcome::Processed(p) => Some(p.frame.sequence),
                FrameOutcome::Skipped(_) => None,
            })
            .collect();
        assert_eq!(processed, vec![3, 6, 9]);
    }

    #[test]
    fn test_detects_on_downsampled_frame_and_rescales() {
        let config = DriverConfig { downsample: 0.25, process_every: 1, ..Default::default() };
        let mut d = driver(vec![0.1, 0.0], config);
        let mut dedup = AttendanceDeduplicator::default();

        let FrameOutcome::Processed(out) = d.process(frame(1), &alice(), &mut dedup).unwrap() else {
            panic!("frame should be processed");
        };
        assert_eq!(d.extractor_mut().seen_sizes, vec![(40, 30)]);

        let face = &out.faces[0];
        assert_eq!((face.region.x, face.region.y), (40.0, 20.0));
        assert_eq!((face.region.width, face.region.height), (80.0, 80.0));
        assert_eq!(face.region.landmarks, Some([(60.0, 40.0); 5]));
        assert_eq!(face.label, "alice");
        assert!(face.known);

        // Box drawn on the full-resolution frame at the rescaled position.
        assert_eq!(out.frame.width, 160);
        assert_eq!(out.frame.data[20 * 160 + 40], BOX_VALUE);
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].label(), "alice");
    }

    #[test]
    fn test_unknown_faces_are_not_deduplicated() {
        let config = DriverConfig { process_every: 1, ..Default::default() };
        let mut d = driver(vec![5.0, 5.0], config);
        let mut dedup = AttendanceDeduplicator::default();
        let FrameOutcome::Processed(out) = d.process(frame(1), &alice(), &mut dedup).unwrap() else {
            panic!("frame should be processed");
        };
        assert_eq!(out.faces[0].label, "Unknown");
        assert!(!out.faces[0].known);
        assert!(out.events.is_empty());
    }

    #[test]
    fn test_confidence_floor_blocks_attendance_but_not_label() {
        // Distance 0.5 of 0.6 gives a low confidence (about 30%).
        let config = DriverConfig { process_every: 1, min_confidence: 80.0, ..Default::default() };
        let mut d = driver(vec![0.5, 0.0], config);
        let mut dedup = AttendanceDeduplicator::default();
        let FrameOutcome::Processed(out) = d.process(frame(1), &alice(), &mut dedup).unwrap() else {
            panic!("frame should be processed");
        };
        assert_eq!(out.faces[0].label, "alice");
        assert!(out.events.is_empty());
        assert!(dedup.last_emitted("alice").is_none());
    }

    #[test]
    fn test_empty_gallery_labels_unknown() {
        let config = DriverConfig { process_every: 1, ..Default::default() };
        let mut d = driver(vec![0.0, 0.0], config);
        let mut dedup = AttendanceDeduplicator::default();
        let FrameOutcome::Processed(out) = d.process(frame(1), &Gallery::empty(), &mut dedup).unwrap() else {
            panic!("frame should be processed");
        };
        assert_eq!(out.faces[0].label, "Unknown");
        assert_eq!(out.faces[0].confidence, None);
    }

    #[test]
    fn test_dimension_mismatch_is_fatal() {
        let config = DriverConfig { process_every: 1, ..Default::default() };
        let mut d = driver(vec![0.0, 0.0, 0.0], config);
        let mut dedup = AttendanceDeduplicator::default();
        let err = d.process(frame(1), &alice(), &mut dedup).unwrap_err();
        assert!(matches!(err, PipelineError::Match(MatchError::DimensionMismatch { .. })));
    }

    /// Detects three faces in a row; the middle one cannot be embedded.
    struct DropsMiddle;

    impl FaceExtractor for DropsMiddle {
        fn detect(&mut self, _frame: &Frame) -> Result<Vec<BoundingBox>, ExtractorError> {
            Ok([0.0, 20.0, 40.0]
                .into_iter()
                .map(|x| BoundingBox {
                    x, y: 0.0, width: 10.0, height: 10.0,
                    confidence: 0.9, landmarks: None,
                })
                .collect())
        }

        fn embed(&mut self, _frame: &Frame, regions: &[BoundingBox]) -> Result<Vec<Detection>, ExtractorError> {
            Ok(regions
                .iter()
                .filter(|r| r.x != 20.0)
                .map(|r| {
                    let values = if r.x == 0.0 { vec![5.0, 5.0] } else { vec![0.0, 0.0] };
                    Detection { region: r.clone(), embedding: Embedding::new(values) }
                })
                .collect())
        }
    }

    #[test]
    fn test_faces_follow_returned_regions_when_embedding_drops_one() {
        let config = DriverConfig { downsample: 0.5, process_every: 1, ..Default::default() };
        let mut d = FrameDriver::new(DropsMiddle, config).unwrap();
        let mut dedup = AttendanceDeduplicator::default();

        let out = d.process_now(frame(1), &alice(), &mut dedup).unwrap();
        assert_eq!(out.faces.len(), 2);

        assert_eq!(out.faces[0].region.x, 0.0);
        assert_eq!(out.faces[0].region.width, 20.0);
        assert_eq!(out.faces[0].label, "Unknown");
        assert!(!out.faces[0].known);

        assert_eq!(out.faces[1].region.x, 80.0);
        assert_eq!(out.faces[1].label, "alice");
        assert!(out.faces[1].known);

        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].label(), "alice");
    }

    struct Countdown(u32);

    impl FrameSource for Countdown {
        type Error = std::io::Error;

        fn next_frame(&mut self) -> Result<Option<Frame>, Self::Error> {
            if self.0 == 0 {
                return Ok(None);
            }
            self.0 -= 1;
            Ok(Some(frame(self.0)))
        }
    }

    #[test]
    fn test_frames_iterator_is_fused() {
        let mut frames = Countdown(2).frames();
        assert!(frames.next().is_some());
        assert!(frames.next().is_some());
        assert!(frames.next().is_none());
        assert!(frames.next().is_none());
    }
}
