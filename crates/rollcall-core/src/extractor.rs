//! Face extraction: localize faces in a frame and embed each one.

use crate::detector::{DetectorError, DetectorThresholds, FaceDetector, SCRFD_MODEL_FILE};
use crate::frame::Frame;
use crate::recognizer::{FaceRecognizer, RecognizerError, ARCFACE_MODEL_FILE};
use crate::types::{BoundingBox, Detection};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Two-stage face extraction.
pub trait FaceExtractor {
    /// Face regions in the coordinate space of `frame`, strongest first.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, ExtractorError>;

    /// One detection per region that could be embedded, in input order.
    ///
    /// Regions with no computable embedding are dropped, so the output can be
    /// shorter than `regions`. Each output carries its own region.
    fn embed(
        &mut self,
        frame: &Frame,
        regions: &[BoundingBox],
    ) -> Result<Vec<Detection>, ExtractorError>;

    /// Detect, then embed.
    fn extract(&mut self, frame: &Frame) -> Result<Vec<Detection>, ExtractorError> {
        let regions = self.detect(frame)?;
        if regions.is_empty() {
            return Ok(Vec::new());
        }
        self.embed(frame, &regions)
    }
}

/// SCRFD detection followed by ArcFace embedding.
pub struct OnnxFaceExtractor {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxFaceExtractor {
    /// Load both models from `model_dir`.
    pub fn load(model_dir: &Path, thresholds: DetectorThresholds) -> Result<Self, ExtractorError> {
        let detector = FaceDetector::load(&model_dir.join(SCRFD_MODEL_FILE), thresholds)?;
        let recognizer = FaceRecognizer::load(&model_dir.join(ARCFACE_MODEL_FILE))?;
        Ok(Self {
            detector,
            recognizer,
        })
    }
}

impl FaceExtractor for OnnxFaceExtractor {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, ExtractorError> {
        Ok(self.detector.detect(frame)?)
    }

    fn embed(
        &mut self,
        frame: &Frame,
        regions: &[BoundingBox],
    ) -> Result<Vec<Detection>, ExtractorError> {
        let mut detections = Vec::with_capacity(regions.len());
        for region in regions {
            match self.recognizer.extract(frame, region)? {
                Some(embedding) => detections.push(Detection {
                    region: region.clone(),
                    embedding,
                }),
                None => tracing::debug!(
                    x = region.x,
                    y = region.y,
                    width = region.width,
                    height = region.height,
                    "dropping region without a computable embedding"
                ),
            }
        }
        Ok(detections)
    }
}
