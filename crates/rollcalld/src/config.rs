use anyhow::{Context, Result};
use rollcall_core::detector::DetectorThresholds;
use rollcall_core::recognizer::ARCFACE_MATCH_THRESHOLD;
use rollcall_core::{paths, DriverConfig};
use rollcall_hw::CaptureSize;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Daemon configuration.
///
/// Built from defaults, then an optional TOML file named by `ROLLCALL_CONFIG`,
/// then `ROLLCALL_*` environment variables, each layer overriding the last.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub capture_width: u32,
    pub capture_height: u32,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// One reference image per person, file stem = label.
    pub faces_dir: PathBuf,
    /// Path to the SQLite attendance database.
    pub db_path: PathBuf,
    /// Euclidean distance at or below which a face matches.
    pub match_threshold: f32,
    /// Detector score floor.
    pub detector_score: f32,
    /// Scale applied to frames before detection.
    pub downsample: f32,
    /// Process one frame out of every N.
    pub process_every: u32,
    /// Minimum seconds between two attendance events for one person.
    pub cooldown_secs: u64,
    /// Minimum match confidence (percent) that counts for attendance.
    pub min_confidence: f32,
    /// Number of frames to discard at startup (camera AGC/AE stabilization).
    pub warmup_frames: usize,
    /// How often the faces directory is checked for changes.
    pub gallery_poll_secs: u64,
    /// If set, the latest annotated frame is written here as an image.
    pub snapshot_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let driver = DriverConfig::default();
        Self {
            camera_device: "/dev/video0".to_string(),
            capture_width: 640,
            capture_height: 480,
            model_dir: paths::default_model_dir(),
            faces_dir: paths::default_faces_dir(),
            db_path: paths::default_db_path(),
            match_threshold: ARCFACE_MATCH_THRESHOLD,
            detector_score: DetectorThresholds::default().score,
            downsample: driver.downsample,
            process_every: driver.process_every,
            cooldown_secs: rollcall_core::attendance::DEFAULT_COOLDOWN_SECS,
            min_confidence: driver.min_confidence,
            warmup_frames: 4,
            gallery_poll_secs: 5,
            snapshot_path: None,
        }
    }
}

impl Config {
    /// Load configuration from the optional file and the process environment.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var_os("ROLLCALL_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config at {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Override fields from `ROLLCALL_*` variables. Unparseable values are
    /// ignored with a warning.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let env = Env(&lookup);
        if let Some(v) = lookup("ROLLCALL_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = lookup("ROLLCALL_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_FACES_DIR") {
            self.faces_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_SNAPSHOT_PATH") {
            self.snapshot_path = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        env.parse("ROLLCALL_CAPTURE_WIDTH", &mut self.capture_width);
        env.parse("ROLLCALL_CAPTURE_HEIGHT", &mut self.capture_height);
        env.parse("ROLLCALL_MATCH_THRESHOLD", &mut self.match_threshold);
        env.parse("ROLLCALL_DETECTOR_SCORE", &mut self.detector_score);
        env.parse("ROLLCALL_DOWNSAMPLE", &mut self.downsample);
        env.parse("ROLLCALL_PROCESS_EVERY", &mut self.process_every);
        env.parse("ROLLCALL_COOLDOWN_SECS", &mut self.cooldown_secs);
        env.parse("ROLLCALL_MIN_CONFIDENCE", &mut self.min_confidence);
        env.parse("ROLLCALL_WARMUP_FRAMES", &mut self.warmup_frames);
        env.parse("ROLLCALL_GALLERY_POLL_SECS", &mut self.gallery_poll_secs);
    }

    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            downsample: self.downsample,
            process_every: self.process_every,
            threshold: self.match_threshold,
            min_confidence: self.min_confidence,
            ..DriverConfig::default()
        }
    }

    pub fn detector_thresholds(&self) -> DetectorThresholds {
        DetectorThresholds {
            score: self.detector_score,
            ..DetectorThresholds::default()
        }
    }

    pub fn capture_size(&self) -> CaptureSize {
        CaptureSize {
            width: self.capture_width,
            height: self.capture_height,
        }
    }
}

struct Env<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn parse<T: std::str::FromStr>(&self, key: &str, slot: &mut T) {
        let Some(raw) = (self.0)(key) else {
            return;
        };
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable environment value"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::recognizer::ARCFACE_EMBEDDING_DIM;
    use rollcall_core::{Embedding, EuclideanMatcher, Gallery, Identity, Matcher};
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.capture_size(), CaptureSize { width: 640, height: 480 });
        assert_eq!(config.match_threshold, ARCFACE_MATCH_THRESHOLD);
        assert_eq!(config.cooldown_secs, 300);
        assert_eq!(config.process_every, 2);
        assert!(config.snapshot_path.is_none());
        assert!(config.driver_config().validate().is_ok());
    }

    /// Two unit vectors with cosine similarity 0.6: a typical same-person pair.
    fn same_person_pair() -> (Embedding, Embedding) {
        let mut a = vec![0.0; ARCFACE_EMBEDDING_DIM];
        let mut b = vec![0.0; ARCFACE_EMBEDDING_DIM];
        a[0] = 1.0;
        b[0] = 0.6;
        b[1] = 0.8;
        (Embedding::new(a), Embedding::new(b))
    }

    #[test]
    fn test_default_threshold_accepts_same_person_pair() {
        let (reference, candidate) = same_person_pair();
        let gallery = Gallery::from_identities(vec![Identity {
            label: "alice".into(),
            embedding: reference,
        }])
        .unwrap();

        let config = Config::default();
        let result = EuclideanMatcher
            .compare(&candidate, &gallery, config.driver_config().threshold)
            .unwrap();
        assert_eq!(result.label.as_deref(), Some("alice"));
        assert!(result.confidence.unwrap() > 0.0);

        let strict = EuclideanMatcher
            .compare(&candidate, &gallery, rollcall_core::matcher::DEFAULT_MATCH_THRESHOLD)
            .unwrap();
        assert!(strict.label.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env(lookup(&[
            ("ROLLCALL_CAMERA_DEVICE", "/dev/video4"),
            ("ROLLCALL_COOLDOWN_SECS", "30"),
            ("ROLLCALL_DOWNSAMPLE", "0.25"),
            ("ROLLCALL_FACES_DIR", "/srv/faces"),
            ("ROLLCALL_SNAPSHOT_PATH", "/run/rollcall/latest.png"),
        ]));
        assert_eq!(config.camera_device, "/dev/video4");
        assert_eq!(config.cooldown_secs, 30);
        assert_eq!(config.driver_config().downsample, 0.25);
        assert_eq!(config.faces_dir, PathBuf::from("/srv/faces"));
        assert_eq!(config.snapshot_path, Some(PathBuf::from("/run/rollcall/latest.png")));
    }

    #[test]
    fn test_bad_env_value_keeps_previous() {
        let mut config = Config::default();
        config.apply_env(lookup(&[("ROLLCALL_PROCESS_EVERY", "often")]));
        assert_eq!(config.process_every, 2);
    }

    #[test]
    fn test_partial_toml_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollcall.toml");
        std::fs::write(&path, "camera_device = \"/dev/video2\"\nmatch_threshold = 0.5\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.camera_device, "/dev/video2");
        assert_eq!(config.match_threshold, 0.5);
        assert_eq!(config.warmup_frames, 4);
    }

    #[test]
    fn test_malformed_toml_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollcall.toml");
        std::fs::write(&path, "match_threshold = \"high\"").unwrap();
        assert!(Config::from_file(&path).is_err());
    }
}
