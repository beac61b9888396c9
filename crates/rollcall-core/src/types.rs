use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detector score in [0, 1].
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Map this box (and its landmarks) from one coordinate space into another
    /// by multiplying every coordinate by `factor`.
    ///
    /// Detections made on a frame downsampled by `f` are mapped back onto the
    /// source frame with `scaled(1.0 / f)`.
    pub fn scaled(&self, factor: f32) -> BoundingBox {
        BoundingBox {
            x: self.x * factor,
            y: self.y * factor,
            width: self.width * factor,
            height: self.height * factor,
            confidence: self.confidence,
            landmarks: self
                .landmarks
                .map(|lms| lms.map(|(lx, ly)| (lx * factor, ly * factor))),
        }
    }

    /// True when the box is too small to crop a face from.
    pub fn is_degenerate(&self) -> bool {
        !(self.width >= 1.0 && self.height >= 1.0)
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// A known person in the gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// Unique, human-assigned label (the reference image's file stem).
    pub label: String,
    pub embedding: Embedding,
}

/// A face found in one frame: its region in the coordinate space of the
/// frame it was detected on, and the embedding computed from that region.
#[derive(Debug, Clone)]
pub struct Detection {
    pub region: BoundingBox,
    pub embedding: Embedding,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_distance_identical() {
        let a = Embedding::new(vec![0.3, 0.4, 0.5]);
        assert_eq!(a.euclidean_distance(&a), 0.0);
    }

    #[test]
    fn test_euclidean_distance_3_4_5() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
        assert!((b.euclidean_distance(&a) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_scaled_box_and_landmarks() {
        let bbox = BoundingBox {
            x: 10.0,
            y: 20.0,
            width: 30.0,
            height: 40.0,
            confidence: 0.9,
            landmarks: Some([(1.0, 2.0); 5]),
        };
        let up = bbox.scaled(2.0);
        assert_eq!((up.x, up.y, up.width, up.height), (20.0, 40.0, 60.0, 80.0));
        assert_eq!(up.confidence, 0.9);
        assert_eq!(up.landmarks, Some([(2.0, 4.0); 5]));
        assert_eq!(up.right(), 80.0);
        assert_eq!(up.bottom(), 120.0);
    }

    #[test]
    fn test_degenerate_box() {
        let mut bbox = BoundingBox {
            x: 0.0, y: 0.0, width: 0.5, height: 10.0,
            confidence: 0.9, landmarks: None,
        };
        assert!(bbox.is_degenerate());
        bbox.width = 4.0;
        assert!(!bbox.is_degenerate());
        bbox.height = f32::NAN;
        assert!(bbox.is_degenerate());
    }
}
