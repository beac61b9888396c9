//! Nearest-identity matching with a distance threshold and confidence score.

use crate::gallery::Gallery;
use crate::types::Embedding;
use serde::Serialize;
use thiserror::Error;

/// Label shown for faces that match no known identity.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Euclidean distance above which a face is not considered a match.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("embedding dimension mismatch: gallery holds {gallery}-d embeddings, probe is {probe}-d")]
    DimensionMismatch { gallery: usize, probe: usize },
}

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    /// Label of the matched identity; `None` means Unknown.
    pub label: Option<String>,
    /// Distance to the closest identity, `None` for an empty gallery.
    pub distance: Option<f32>,
    /// Percentage derived from `distance`, `None` for an empty gallery.
    /// Diagnostic only: it never changes the match decision.
    pub confidence: Option<f32>,
}

impl MatchResult {
    pub fn unknown() -> Self {
        Self {
            label: None,
            distance: None,
            confidence: None,
        }
    }

    pub fn is_known(&self) -> bool {
        self.label.is_some()
    }

    /// The matched label, or "Unknown".
    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(UNKNOWN_LABEL)
    }
}

/// Strategy for comparing a probe embedding against the gallery.
pub trait Matcher {
    fn compare(
        &self,
        probe: &Embedding,
        gallery: &Gallery,
        threshold: f32,
    ) -> Result<MatchResult, MatchError>;
}

/// Minimum Euclidean distance matcher.
///
/// Always walks every gallery entry; on ties the earliest entry wins, so
/// repeated calls against the same gallery are deterministic.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(
        &self,
        probe: &Embedding,
        gallery: &Gallery,
        threshold: f32,
    ) -> Result<MatchResult, MatchError> {
        if let Some(dim) = gallery.dimension() {
            if dim != probe.dimension() {
                return Err(MatchError::DimensionMismatch {
                    gallery: dim,
                    probe: probe.dimension(),
                });
            }
        }

        let mut best: Option<(usize, f32)> = None;
        for (i, identity) in gallery.identities().iter().enumerate() {
            let d = probe.euclidean_distance(&identity.embedding);
            if best.map_or(true, |(_, best_d)| d < best_d) {
                best = Some((i, d));
            }
        }

        let Some((idx, distance)) = best else {
            return Ok(MatchResult::unknown());
        };

        let label = (distance <= threshold).then(|| gallery.identities()[idx].label.clone());
        Ok(MatchResult {
            label,
            distance: Some(distance),
            confidence: Some(confidence(distance, threshold)),
        })
    }
}

/// Map a match distance to a 0–100 percentage.
///
/// Within the threshold the linear position `lin = (threshold - d) / threshold`
/// is boosted by `lin + (1 - lin) * lin`, giving 100% at d = 0 and 0% at
/// d = threshold with a finite slope at both ends. Beyond the threshold the
/// linear value saturates at 0.
pub fn confidence(distance: f32, threshold: f32) -> f32 {
    if threshold <= 0.0 {
        return if distance <= 0.0 { 100.0 } else { 0.0 };
    }
    let lin = ((threshold - distance) / threshold).clamp(0.0, 1.0);
    (lin + (1.0 - lin) * lin) * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Identity;

    fn identity(label: &str, values: Vec<f32>) -> Identity {
        Identity { label: label.into(), embedding: Embedding::new(values) }
    }

    #[test]
    fn test_alice_at_distance_0_3() {
        let gallery = Gallery::from_identities(vec![identity("alice", vec![0.0, 0.0])]).unwrap();
        let probe = Embedding::new(vec![0.3, 0.0]);
        let result = EuclideanMatcher.compare(&probe, &gallery, 0.6).unwrap();
        assert_eq!(result.label.as_deref(), Some("alice"));
        assert!((result.distance.unwrap() - 0.3).abs() < 1e-6);
        let c = result.confidence.unwrap();
        assert!(c > 50.0 && c < 100.0, "confidence {c}");
    }

    #[test]
    fn test_beyond_threshold_is_unknown() {
        let gallery = Gallery::from_identities(vec![
            identity("alice", vec![1.0, 0.0]),
            identity("bob", vec![0.0, 1.0]),
        ])
        .unwrap();
        // Closest is alice at 0.7, still beyond 0.6.
        let probe = Embedding::new(vec![0.3, 0.0]);
        let result = EuclideanMatcher.compare(&probe, &gallery, 0.6).unwrap();
        assert!(!result.is_known());
        assert_eq!(result.display_label(), UNKNOWN_LABEL);
        assert!((result.distance.unwrap() - 0.7).abs() < 1e-6);
        assert_eq!(result.confidence, Some(0.0));
    }

    #[test]
    fn test_picks_minimum_over_whole_gallery() {
        let gallery = Gallery::from_identities(vec![
            identity("decoy1", vec![0.0, 1.0, 0.0]),
            identity("decoy2", vec![0.0, 0.0, 1.0]),
            identity("match", vec![1.0, 0.0, 0.0]),
        ])
        .unwrap();
        let probe = Embedding::new(vec![1.0, 0.0, 0.0]);
        let result = EuclideanMatcher.compare(&probe, &gallery, 0.6).unwrap();
        assert_eq!(result.label.as_deref(), Some("match"));
        assert_eq!(result.distance, Some(0.0));
        assert_eq!(result.confidence, Some(100.0));
    }

    #[test]
    fn test_deterministic_with_ties() {
        let gallery = Gallery::from_identities(vec![
            identity("first", vec![1.0, 0.0]),
            identity("second", vec![-1.0, 0.0]),
        ])
        .unwrap();
        let probe = Embedding::new(vec![0.0, 0.0]);
        let a = EuclideanMatcher.compare(&probe, &gallery, 2.0).unwrap();
        let b = EuclideanMatcher.compare(&probe, &gallery, 2.0).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.label.as_deref(), Some("first"));
    }

    #[test]
    fn test_empty_gallery_is_unknown_without_error() {
        let probe = Embedding::new(vec![0.5, 0.5]);
        let result = EuclideanMatcher.compare(&probe, &Gallery::empty(), 0.6).unwrap();
        assert_eq!(result, MatchResult::unknown());
        assert_eq!(result.display_label(), "Unknown");
    }

    #[test]
    fn test_dimension_mismatch_is_error() {
        let gallery = Gallery::from_identities(vec![identity("alice", vec![0.0, 0.0])]).unwrap();
        let probe = Embedding::new(vec![0.0, 0.0, 0.0]);
        assert_eq!(
            EuclideanMatcher.compare(&probe, &gallery, 0.6),
            Err(MatchError::DimensionMismatch { gallery: 2, probe: 3 })
        );
    }

    #[test]
    fn test_confidence_endpoints() {
        assert!((confidence(0.0, 0.6) - 100.0).abs() < 1e-4);
        assert!(confidence(0.6, 0.6).abs() < 1e-4);
        assert_eq!(confidence(1.5, 0.6), 0.0);
    }

    #[test]
    fn test_confidence_monotone_non_increasing() {
        let threshold = 0.6;
        let mut prev = f32::INFINITY;
        for step in 0..=120 {
            let d = step as f32 * 0.01;
            let c = confidence(d, threshold);
            assert!(c <= prev + 1e-4, "confidence rose at d={d}: {prev} -> {c}");
            assert!((0.0..=100.0).contains(&c));
            prev = c;
        }
    }

    #[test]
    fn test_confidence_continuous_at_threshold() {
        let below = confidence(0.6 - 1e-4, 0.6);
        let above = confidence(0.6 + 1e-4, 0.6);
        assert!(below - above < 5.0, "jump at threshold: {below} vs {above}");
    }
}
