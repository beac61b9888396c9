//! Keeps the gallery in step with the faces directory.

use anyhow::{Context, Result};
use rollcall_core::gallery::RebuildReport;
use rollcall_core::{scan_directory, DescriptorStore, ImageFileLoader, OnnxFaceExtractor};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

/// What identifies the directory's content: name, size and mtime per image.
pub type Fingerprint = Vec<(PathBuf, u64, Option<SystemTime>)>;

/// Fingerprint the reference images in `dir`. A missing directory is empty.
pub fn fingerprint(dir: &Path) -> Result<Fingerprint> {
    let references = scan_directory(dir)?;
    let mut out = Vec::with_capacity(references.len());
    for reference in references {
        let meta = std::fs::metadata(&reference.path)
            .with_context(|| format!("stat {}", reference.path.display()))?;
        out.push((reference.path, meta.len(), meta.modified().ok()));
    }
    Ok(out)
}

/// Rebuilds the descriptor store whenever the faces directory changes.
///
/// Uses its own extractor so rebuilds never contend with the recognition
/// thread's models.
pub struct GalleryWatcher {
    faces_dir: PathBuf,
    store: Arc<DescriptorStore>,
    extractor: Arc<Mutex<OnnxFaceExtractor>>,
    interval: Duration,
    last: Option<Fingerprint>,
}

impl GalleryWatcher {
    pub fn new(
        faces_dir: PathBuf,
        store: Arc<DescriptorStore>,
        extractor: OnnxFaceExtractor,
        interval: Duration,
    ) -> Self {
        Self {
            faces_dir,
            store,
            extractor: Arc::new(Mutex::new(extractor)),
            interval,
            last: None,
        }
    }

    /// Rebuild if the directory changed since the last successful rebuild.
    ///
    /// Returns the report when a rebuild ran.
    pub async fn poll(&mut self) -> Result<Option<RebuildReport>> {
        let dir = self.faces_dir.clone();
        let current = tokio::task::spawn_blocking(move || fingerprint(&dir)).await??;
        if self.last.as_ref() == Some(&current) {
            return Ok(None);
        }

        let report = self.rebuild().await?;
        self.last = Some(current);
        Ok(Some(report))
    }

    /// Rebuild from the directory unconditionally.
    pub async fn rebuild(&self) -> Result<RebuildReport> {
        let dir = self.faces_dir.clone();
        let store = self.store.clone();
        let extractor = self.extractor.clone();

        tokio::task::spawn_blocking(move || -> Result<RebuildReport> {
            let references = scan_directory(&dir)?;
            let mut extractor = extractor.lock().unwrap_or_else(PoisonError::into_inner);
            let report = store.rebuild(&mut *extractor, &ImageFileLoader, &references)?;
            Ok(report)
        })
        .await?
    }

    /// Poll forever at the configured interval. Errors are logged and the
    /// previous gallery stays in place.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.poll().await {
                Ok(Some(report)) => {
                    tracing::info!(version = report.version, "faces directory changed; gallery reloaded")
                }
                Ok(None) => {}
                Err(e) => tracing::error!(
                    dir = %self.faces_dir.display(),
                    error = %e,
                    "gallery rebuild failed; keeping previous gallery"
                ),
            }
        }
    }
}
