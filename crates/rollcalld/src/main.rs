use anyhow::{Context, Result};
use rollcall_core::recognizer::ARCFACE_EMBEDDING_DIM;
use rollcall_core::{DescriptorStore, OnnxFaceExtractor};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod watcher;

use watcher::GalleryWatcher;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");
    let config = config::Config::load()?;
    tracing::debug!(?config, "configuration loaded");

    let gallery = Arc::new(DescriptorStore::with_dimension(ARCFACE_EMBEDDING_DIM));

    // The watcher gets its own model sessions; the engine thread loads another pair.
    let rebuild_extractor = OnnxFaceExtractor::load(&config.model_dir, config.detector_thresholds())
        .with_context(|| format!("loading face models from {}", config.model_dir.display()))?;
    let mut watcher = GalleryWatcher::new(
        config.faces_dir.clone(),
        gallery.clone(),
        rebuild_extractor,
        Duration::from_secs(config.gallery_poll_secs.max(1)),
    );
    let report = watcher
        .poll()
        .await
        .context("building gallery from faces directory")?
        .unwrap_or_default();
    if report.usable_count() == 0 {
        tracing::warn!(
            dir = %config.faces_dir.display(),
            "no usable reference images; every face will be Unknown until some are added"
        );
    }

    let engine = engine::spawn_engine(&config, gallery.clone())
        .await
        .context("starting recognition engine")?;
    let stop = engine.stop_flag();
    let watcher_task = tokio::spawn(watcher.run());

    tracing::info!(identities = gallery.snapshot().len(), "rollcalld ready");

    let mut finished = std::pin::pin!(engine.finished());
    let early = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            None
        }
        result = &mut finished => Some(result),
    };
    let result = match early {
        Some(result) => result,
        None => {
            tracing::info!("rollcalld shutting down");
            stop.store(true, Ordering::Relaxed);
            finished.await
        }
    };

    watcher_task.abort();
    let summary = result.context("recognition engine failed")?;
    tracing::info!(
        frames = summary.frames_read,
        processed = summary.frames_processed,
        written = summary.written,
        write_failures = summary.write_failures,
        "rollcalld stopped"
    );
    Ok(())
}
