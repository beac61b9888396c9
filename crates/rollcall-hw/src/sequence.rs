//! Replay a directory of still images as a frame stream.

use chrono::{DateTime, Duration, Local};
use rollcall_core::gallery::{LoadError, SUPPORTED_EXTENSIONS};
use rollcall_core::{Frame, FrameSource, ImageFileLoader, ReferenceImageLoader};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SequenceError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot load {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: LoadError,
    },
    #[error("timestamp of frame {sequence} is out of range")]
    Clock { sequence: u32 },
}

/// Frames read from image files in lexicographic path order.
///
/// Frame `n` is stamped `start + n * interval`, so cooldown behaviour on a
/// replay does not depend on how fast the files decode.
pub struct ImageSequence {
    paths: VecDeque<PathBuf>,
    loader: ImageFileLoader,
    start: DateTime<Local>,
    interval: Duration,
    sequence: u32,
}

impl ImageSequence {
    /// Every supported image file directly inside `dir`.
    pub fn from_dir(dir: &Path) -> Result<Self, SequenceError> {
        let entries = std::fs::read_dir(dir).map_err(|source| SequenceError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| SequenceError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            if path.is_file() && is_supported(&path) {
                paths.push(path);
            }
        }
        paths.sort();
        tracing::debug!(dir = %dir.display(), frames = paths.len(), "image sequence opened");
        Ok(Self::from_paths(paths))
    }

    pub fn from_paths(paths: Vec<PathBuf>) -> Self {
        Self {
            paths: paths.into(),
            loader: ImageFileLoader,
            start: Local::now(),
            interval: Duration::milliseconds(33),
            sequence: 0,
        }
    }

    /// Stamp frames starting at `start`, `interval` apart.
    pub fn with_clock(mut self, start: DateTime<Local>, interval: Duration) -> Self {
        self.start = start;
        self.interval = interval;
        self
    }

    pub fn remaining(&self) -> usize {
        self.paths.len()
    }
}

fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SUPPORTED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

impl FrameSource for ImageSequence {
    type Error = SequenceError;

    fn next_frame(&mut self) -> Result<Option<Frame>, Self::Error> {
        let Some(path) = self.paths.pop_front() else {
            return Ok(None);
        };
        let frame = self
            .loader
            .load(&path)
            .map_err(|source| SequenceError::Load { path, source })?;

        let stamp = i32::try_from(self.sequence)
            .ok()
            .and_then(|n| self.interval.checked_mul(n))
            .and_then(|offset| self.start.checked_add_signed(offset))
            .ok_or(SequenceError::Clock {
                sequence: self.sequence,
            })?;
        let frame = frame.with_sequence(self.sequence).with_timestamp(stamp);
        self.sequence += 1;
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn write_png(dir: &Path, name: &str, value: u8) {
        image::GrayImage::from_pixel(4, 3, image::Luma([value]))
            .save(dir.join(name))
            .unwrap();
    }

    #[test]
    fn test_replays_in_path_order_then_ends() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "002.png", 20);
        write_png(dir.path(), "001.png", 10);
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let start = Local.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let mut seq = ImageSequence::from_dir(dir.path())
            .unwrap()
            .with_clock(start, Duration::seconds(10));
        assert_eq!(seq.remaining(), 2);

        let first = seq.next_frame().unwrap().unwrap();
        assert_eq!((first.width, first.height), (4, 3));
        assert_eq!(first.data[0], 10);
        assert_eq!(first.sequence, 0);
        assert_eq!(first.captured_at, start);

        let second = seq.next_frame().unwrap().unwrap();
        assert_eq!(second.data[0], 20);
        assert_eq!(second.captured_at, start + Duration::seconds(10));

        assert!(seq.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_undecodable_file_is_an_error_not_end_of_stream() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.jpg"), b"not a jpeg").unwrap();
        let mut seq = ImageSequence::from_dir(dir.path()).unwrap();
        assert!(matches!(seq.next_frame(), Err(SequenceError::Load { .. })));
    }

    #[test]
    fn test_timestamp_overflow_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "001.png", 10);
        write_png(dir.path(), "002.png", 20);

        let start = Local.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let mut seq = ImageSequence::from_dir(dir.path())
            .unwrap()
            .with_clock(start, Duration::days(100_000_000));

        assert_eq!(seq.next_frame().unwrap().unwrap().captured_at, start);
        assert!(matches!(seq.next_frame(), Err(SequenceError::Clock { sequence: 1 })));
    }

    #[test]
    fn test_missing_dir() {
        assert!(matches!(
            ImageSequence::from_dir(Path::new("/nonexistent/rollcall")),
            Err(SequenceError::Io { .. })
        ));
    }
}
