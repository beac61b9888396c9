use crate::config::Config;
use rollcall_core::{
    run, AttendanceDeduplicator, DescriptorStore, ExtractorError, FrameDriver, OnnxFaceExtractor,
    PipelineError, ProcessedFrame, RunSummary,
};
use rollcall_hw::{Camera, CameraError};
use rollcall_store::{SqliteAttendanceStore, StoreError};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("model error: {0}")]
    Extractor(#[from] ExtractorError),
    #[error("attendance store error: {0}")]
    Store(#[from] StoreError),
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Handle to the running recognition thread.
pub struct EngineHandle {
    stop: Arc<AtomicBool>,
    done: oneshot::Receiver<Result<RunSummary, EngineError>>,
}

impl EngineHandle {
    /// The flag the recognition loop polls once per frame.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Wait for the recognition loop to end, by stop request or by error.
    pub async fn finished(self) -> Result<RunSummary, EngineError> {
        self.done.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Everything the engine thread needs, detached from `Config`.
struct EngineSetup {
    camera_device: String,
    capture: rollcall_hw::CaptureSize,
    model_dir: PathBuf,
    db_path: PathBuf,
    warmup_frames: usize,
    cooldown_secs: u64,
    snapshot_path: Option<PathBuf>,
    driver: rollcall_core::DriverConfig,
    detector: rollcall_core::detector::DetectorThresholds,
}

/// Spawn the recognition loop on a dedicated OS thread.
///
/// The thread loads the models, opens the camera, discards warmup frames and
/// opens the attendance database before reporting ready. Fails fast if any
/// of those is unavailable; the camera is held only by the thread and is
/// released when the loop ends.
pub async fn spawn_engine(
    config: &Config,
    gallery: Arc<DescriptorStore>,
) -> Result<EngineHandle, EngineError> {
    let setup = EngineSetup {
        camera_device: config.camera_device.clone(),
        capture: config.capture_size(),
        model_dir: config.model_dir.clone(),
        db_path: config.db_path.clone(),
        warmup_frames: config.warmup_frames,
        cooldown_secs: config.cooldown_secs,
        snapshot_path: config.snapshot_path.clone(),
        driver: config.driver_config(),
        detector: config.detector_thresholds(),
    };
    let stop = Arc::new(AtomicBool::new(false));
    let (ready_tx, ready_rx) = oneshot::channel::<Result<(), EngineError>>();
    let (done_tx, done_rx) = oneshot::channel();

    let thread_stop = stop.clone();
    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            let resources = match open_resources(&setup) {
                Ok(resources) => resources,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));

            let result = run_engine(resources, &setup, &gallery, &thread_stop);
            match &result {
                Ok(summary) => tracing::info!(
                    end = ?summary.end,
                    frames = summary.frames_read,
                    events = summary.events,
                    written = summary.written,
                    "engine thread exiting"
                ),
                Err(e) => tracing::error!(error = %e, "engine thread failed"),
            }
            let _ = done_tx.send(result);
        })
        .map_err(EngineError::Spawn)?;

    ready_rx.await.map_err(|_| EngineError::ChannelClosed)??;
    Ok(EngineHandle { stop, done: done_rx })
}

struct Resources {
    driver: FrameDriver<OnnxFaceExtractor>,
    camera: Camera,
    attendance: SqliteAttendanceStore,
}

fn open_resources(setup: &EngineSetup) -> Result<Resources, EngineError> {
    let extractor = OnnxFaceExtractor::load(&setup.model_dir, setup.detector)?;
    tracing::info!(dir = %setup.model_dir.display(), "face models loaded");
    let driver = FrameDriver::new(extractor, setup.driver.clone())?;

    let mut camera = Camera::open(&setup.camera_device, setup.capture)?;
    tracing::info!(
        device = %setup.camera_device,
        width = camera.width,
        height = camera.height,
        fourcc = ?camera.fourcc,
        "camera opened"
    );
    if setup.warmup_frames > 0 {
        tracing::info!(count = setup.warmup_frames, "discarding warmup frames");
        camera.warm_up(setup.warmup_frames)?;
    }

    let attendance = SqliteAttendanceStore::open(&setup.db_path)?;
    tracing::info!(path = %setup.db_path.display(), "attendance database open");
    Ok(Resources {
        driver,
        camera,
        attendance,
    })
}

fn run_engine(
    resources: Resources,
    setup: &EngineSetup,
    gallery: &DescriptorStore,
    stop: &AtomicBool,
) -> Result<RunSummary, EngineError> {
    let Resources {
        mut driver,
        camera,
        mut attendance,
    } = resources;
    let mut dedup = AttendanceDeduplicator::from_secs(setup.cooldown_secs);
    tracing::info!(cooldown_secs = dedup.cooldown().num_seconds(), "recognition loop starting");
    let snapshot_path = setup.snapshot_path.as_deref();

    let summary = run(
        &mut driver,
        camera,
        gallery,
        &mut dedup,
        &mut attendance,
        stop,
        |processed| report_frame(processed, snapshot_path),
    )?;
    Ok(summary)
}

fn report_frame(processed: &ProcessedFrame, snapshot_path: Option<&Path>) {
    for face in &processed.faces {
        tracing::debug!(
            seq = processed.frame.sequence,
            label = %face.label,
            confidence = face.confidence,
            distance = face.distance,
            "face"
        );
    }
    if let Some(path) = snapshot_path {
        if let Err(e) = write_snapshot(processed, path) {
            tracing::warn!(path = %path.display(), error = %e, "failed to write snapshot");
        }
    }
}

/// Write the annotated frame next to `path` and rename it into place, so
/// readers never see a partial image.
fn write_snapshot(processed: &ProcessedFrame, path: &Path) -> Result<(), image::ImageError> {
    let Some(image) = processed.frame.to_luma() else {
        return Ok(());
    };
    let format = image::ImageFormat::from_path(path).unwrap_or(image::ImageFormat::Png);
    let tmp = path.with_extension("tmp");
    image.save_with_format(&tmp, format)?;
    std::fs::rename(&tmp, path).map_err(image::ImageError::IoError)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::Frame;

    #[test]
    fn test_snapshot_written_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("latest.png");
        let processed = ProcessedFrame {
            frame: Frame::new(vec![7u8; 12], 4, 3).unwrap(),
            faces: Vec::new(),
            events: Vec::new(),
            gallery_version: 0,
        };

        write_snapshot(&processed, &path).unwrap();
        let decoded = image::open(&path).unwrap().to_luma8();
        assert_eq!(decoded.dimensions(), (4, 3));
        assert!(!path.with_extension("tmp").exists());
    }
}
