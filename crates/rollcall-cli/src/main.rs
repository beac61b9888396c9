use anyhow::{bail, Context, Result};
use chrono::{Duration, Local, NaiveDate};
use clap::{Args, Parser, Subcommand};
use rollcall_core::detector::DetectorThresholds;
use rollcall_core::recognizer::{ARCFACE_EMBEDDING_DIM, ARCFACE_MATCH_THRESHOLD};
use rollcall_core::{
    paths, run, AttendanceDeduplicator, AttendanceStore, DescriptorStore, DriverConfig,
    FrameDriver, ImageFileLoader, MemoryAttendanceStore, OnnxFaceExtractor, ReferenceImage,
    ReferenceImageLoader, UNKNOWN_LABEL,
};
use rollcall_hw::{Camera, CaptureSize, ImageSequence};
use rollcall_store::SqliteAttendanceStore;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-recognition attendance: gallery, identification and records")]
struct Cli {
    #[command(flatten)]
    paths: PathArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct PathArgs {
    /// Directory containing det_10g.onnx and w600k_r50.onnx
    #[arg(long, global = true, env = "ROLLCALL_MODEL_DIR")]
    model_dir: Option<PathBuf>,
    /// Directory of reference images, one per person
    #[arg(long, global = true, env = "ROLLCALL_FACES_DIR")]
    faces_dir: Option<PathBuf>,
    /// Attendance database
    #[arg(long, global = true, env = "ROLLCALL_DB_PATH")]
    db_path: Option<PathBuf>,
}

impl PathArgs {
    fn model_dir(&self) -> PathBuf {
        self.model_dir.clone().unwrap_or_else(paths::default_model_dir)
    }

    fn faces_dir(&self) -> PathBuf {
        self.faces_dir.clone().unwrap_or_else(paths::default_faces_dir)
    }

    fn db_path(&self) -> PathBuf {
        self.db_path.clone().unwrap_or_else(paths::default_db_path)
    }
}

#[derive(Args)]
struct MatchArgs {
    /// Euclidean distance at or below which a face matches
    #[arg(long, default_value_t = ARCFACE_MATCH_THRESHOLD)]
    threshold: f32,
    /// Detector score floor
    #[arg(long, default_value_t = DetectorThresholds::default().score)]
    detector_score: f32,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a person to the faces directory from a photo
    Register {
        /// Photo containing exactly the person to register
        image: PathBuf,
        /// Name to register under (default: the image's file stem)
        #[arg(short, long)]
        label: Option<String>,
        #[command(flatten)]
        matching: MatchArgs,
    },
    /// Build the gallery from the faces directory and report unusable images
    Gallery {
        #[command(flatten)]
        matching: MatchArgs,
    },
    /// Identify the faces in a still image
    Identify {
        image: PathBuf,
        /// Write the annotated image here
        #[arg(long)]
        annotate: Option<PathBuf>,
        #[command(flatten)]
        matching: MatchArgs,
    },
    /// Run the attendance pipeline over a directory of frames
    Replay {
        /// Directory of frame images, processed in file-name order
        frames: PathBuf,
        /// Seconds between consecutive frames
        #[arg(long, default_value_t = 1)]
        frame_interval: u32,
        /// Process one frame out of every N
        #[arg(long, default_value_t = 1)]
        process_every: u32,
        /// Scale applied before detection
        #[arg(long, default_value_t = 1.0)]
        downsample: f32,
        #[arg(long, default_value_t = rollcall_core::attendance::DEFAULT_COOLDOWN_SECS)]
        cooldown_secs: u64,
        /// Write events to the attendance database instead of memory
        #[arg(long)]
        record: bool,
        #[command(flatten)]
        matching: MatchArgs,
    },
    /// List attendance records
    Attendance {
        /// Only this date (YYYY-MM-DD); `today` for the current date
        #[arg(long)]
        date: Option<String>,
        /// Per-person totals instead of individual records
        #[arg(long)]
        summary: bool,
    },
    /// List V4L2 capture devices
    Devices,
    /// Capture a few frames and report brightness
    Test {
        #[arg(long, default_value = "/dev/video0", env = "ROLLCALL_CAMERA_DEVICE")]
        device: String,
        #[arg(long, default_value_t = 10)]
        frames: usize,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let paths = &cli.paths;

    match cli.command {
        Commands::Register {
            image,
            label,
            matching,
        } => register(paths, &image, label, &matching),
        Commands::Gallery { matching } => {
            let mut extractor = load_extractor(paths, &matching)?;
            let store = DescriptorStore::with_dimension(ARCFACE_EMBEDDING_DIM);
            let report = build_gallery(paths, &store, &mut extractor)?;
            print_json(&report)
        }
        Commands::Identify {
            image,
            annotate,
            matching,
        } => identify(paths, &image, annotate.as_deref(), &matching),
        Commands::Replay {
            frames,
            frame_interval,
            process_every,
            downsample,
            cooldown_secs,
            record,
            matching,
        } => {
            let driver = DriverConfig {
                downsample,
                process_every,
                threshold: matching.threshold,
                ..DriverConfig::default()
            };
            let replay = Replay {
                frames,
                frame_interval,
                cooldown_secs,
                record,
            };
            replay.run(paths, &matching, driver)
        }
        Commands::Attendance { date, summary } => attendance(paths, date.as_deref(), summary),
        Commands::Devices => {
            let devices: Vec<_> = Camera::list_devices()
                .into_iter()
                .map(|d| json!({ "path": d.path, "name": d.name, "driver": d.driver, "bus": d.bus }))
                .collect();
            print_json(&devices)
        }
        Commands::Test { device, frames } => camera_test(&device, frames),
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_extractor(paths: &PathArgs, matching: &MatchArgs) -> Result<OnnxFaceExtractor> {
    let model_dir = paths.model_dir();
    let thresholds = DetectorThresholds {
        score: matching.detector_score,
        ..DetectorThresholds::default()
    };
    OnnxFaceExtractor::load(&model_dir, thresholds)
        .with_context(|| format!("loading face models from {}", model_dir.display()))
}

fn build_gallery(
    paths: &PathArgs,
    store: &DescriptorStore,
    extractor: &mut OnnxFaceExtractor,
) -> Result<rollcall_core::gallery::RebuildReport> {
    let faces_dir = paths.faces_dir();
    let references = rollcall_core::scan_directory(&faces_dir)?;
    tracing::info!(dir = %faces_dir.display(), images = references.len(), "building gallery");
    Ok(store.rebuild(extractor, &ImageFileLoader, &references)?)
}

/// Check the photo yields a face, then copy it into the faces directory.
///
/// An unusable photo is rejected and nothing is written.
fn register(paths: &PathArgs, image: &Path, label: Option<String>, matching: &MatchArgs) -> Result<()> {
    let label = match label {
        Some(label) => label,
        None => ReferenceImage::from_path(image)
            .map(|r| r.label)
            .with_context(|| format!("cannot derive a label from {}", image.display()))?,
    };
    check_label(&label)?;
    let ext = image
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .filter(|e| rollcall_core::gallery::SUPPORTED_EXTENSIONS.contains(&e.as_str()))
        .with_context(|| format!("{} is not a jpg or png image", image.display()))?;

    let mut extractor = load_extractor(paths, matching)?;
    let store = DescriptorStore::with_dimension(ARCFACE_EMBEDDING_DIM);
    let reference = ReferenceImage {
        label: label.clone(),
        path: image.to_path_buf(),
    };
    let outcome = store
        .register(&mut extractor, &ImageFileLoader, &reference)
        .with_context(|| format!("registering {label}"))?;

    let (dest, replaced) = store_reference(&paths.faces_dir(), image, &label, &ext)?;
    print_json(&json!({
        "label": label,
        "path": dest,
        "faces": outcome.faces,
        "replaced": replaced,
    }))
}

/// Labels become file names inside the faces directory.
fn check_label(label: &str) -> Result<()> {
    if label == UNKNOWN_LABEL {
        bail!("\"{UNKNOWN_LABEL}\" is reserved");
    }
    if label.is_empty() || label == "." || label == ".." || label.contains(['/', '\\']) {
        bail!("invalid label {label:?}: must be a plain file name");
    }
    Ok(())
}

/// Copy `image` to `<faces_dir>/<label>.<ext>`, removing the label's images
/// under other extensions. Returns the destination and whether the label
/// already had an image.
fn store_reference(faces_dir: &Path, image: &Path, label: &str, ext: &str) -> Result<(PathBuf, bool)> {
    std::fs::create_dir_all(faces_dir)
        .with_context(|| format!("creating {}", faces_dir.display()))?;

    let existing: Vec<PathBuf> = rollcall_core::gallery::SUPPORTED_EXTENSIONS
        .iter()
        .map(|e| faces_dir.join(format!("{label}.{e}")))
        .filter(|p| p.exists())
        .collect();
    let dest = faces_dir.join(format!("{label}.{ext}"));

    for stale in existing.iter().filter(|p| **p != dest) {
        std::fs::remove_file(stale).with_context(|| format!("removing {}", stale.display()))?;
    }
    std::fs::copy(image, &dest).with_context(|| format!("copying to {}", dest.display()))?;
    tracing::info!(label, path = %dest.display(), "reference image stored");
    Ok((dest, !existing.is_empty()))
}

fn identify(paths: &PathArgs, image: &Path, annotate: Option<&Path>, matching: &MatchArgs) -> Result<()> {
    let mut extractor = load_extractor(paths, matching)?;
    let store = DescriptorStore::with_dimension(ARCFACE_EMBEDDING_DIM);
    build_gallery(paths, &store, &mut extractor)?;

    let frame = ImageFileLoader
        .load(image)
        .with_context(|| format!("loading {}", image.display()))?;
    let config = DriverConfig {
        downsample: 1.0,
        process_every: 1,
        threshold: matching.threshold,
        ..DriverConfig::default()
    };
    let mut driver = FrameDriver::new(extractor, config)?;
    let mut dedup = AttendanceDeduplicator::default();
    let processed = driver.process_now(frame, &store.snapshot(), &mut dedup)?;

    if let Some(out) = annotate {
        processed
            .frame
            .to_luma()
            .context("annotated frame has no pixels")?
            .save(out)
            .with_context(|| format!("writing {}", out.display()))?;
    }
    print_json(&processed.faces)
}

struct Replay {
    frames: PathBuf,
    frame_interval: u32,
    cooldown_secs: u64,
    record: bool,
}

impl Replay {
    fn run(self, paths: &PathArgs, matching: &MatchArgs, driver_config: DriverConfig) -> Result<()> {
        let mut extractor = load_extractor(paths, matching)?;
        let store = DescriptorStore::with_dimension(ARCFACE_EMBEDDING_DIM);
        build_gallery(paths, &store, &mut extractor)?;

        let source = ImageSequence::from_dir(&self.frames)?
            .with_clock(Local::now(), Duration::seconds(i64::from(self.frame_interval)));
        tracing::info!(dir = %self.frames.display(), frames = source.remaining(), "replaying frames");
        let mut driver = FrameDriver::new(extractor, driver_config)?;
        let mut dedup = AttendanceDeduplicator::from_secs(self.cooldown_secs);
        let stop = AtomicBool::new(false);
        let mut events = Vec::new();
        let mut collect = |p: &rollcall_core::ProcessedFrame| {
            events.extend(p.events.iter().map(|e| e.record()));
        };

        let summary = if self.record {
            let mut db = SqliteAttendanceStore::open(paths.db_path())?;
            run(&mut driver, source, &store, &mut dedup, &mut db, &stop, &mut collect)?
        } else {
            let mut memory = MemoryAttendanceStore::default();
            run(&mut driver, source, &store, &mut dedup, &mut memory, &stop, &mut collect)?
        };

        print_json(&json!({ "summary": summary, "events": events }))
    }
}

fn attendance(paths: &PathArgs, date: Option<&str>, summary: bool) -> Result<()> {
    let db_path = paths.db_path();
    if !db_path.exists() {
        bail!("no attendance database at {}", db_path.display());
    }
    let store = SqliteAttendanceStore::open(&db_path)?;

    if summary {
        let rows: Vec<_> = store
            .summary()?
            .into_iter()
            .map(|s| json!({ "label": s.label, "days": s.days, "first": s.first, "last": s.last }))
            .collect();
        return print_json(&rows);
    }

    match date.map(parse_date).transpose()? {
        Some(date) => print_json(&json!({
            "date": date,
            "present": store.count_on(date)?,
            "records": store.list(Some(date))?,
        })),
        None => print_json(&store.list(None)?),
    }
}

fn parse_date(raw: &str) -> Result<NaiveDate> {
    if raw == "today" {
        return Ok(Local::now().date_naive());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").with_context(|| format!("invalid date {raw:?}, expected YYYY-MM-DD"))
}

fn camera_test(device: &str, frames: usize) -> Result<()> {
    let mut camera = Camera::open(device, CaptureSize::default())?;
    let mut readings = Vec::with_capacity(frames);
    for _ in 0..frames {
        let frame = camera.capture_frame()?;
        readings.push(json!({
            "sequence": frame.sequence,
            "brightness": frame.avg_brightness(),
            "dark": rollcall_hw::convert::is_dark_frame(&frame.data, 0.95),
        }));
    }
    print_json(&json!({
        "device": device,
        "width": camera.width,
        "height": camera.height,
        "format": format!("{:?}", camera.pixel_format()),
        "frames": readings,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_date() {
        assert_eq!(parse_date("2026-03-02").unwrap(), NaiveDate::from_ymd_opt(2026, 3, 2).unwrap());
        assert_eq!(parse_date("today").unwrap(), Local::now().date_naive());
        assert!(parse_date("03/02/2026").is_err());
    }

    #[test]
    fn test_default_threshold_is_arcface_operating_point() {
        let cli = Cli::try_parse_from(["rollcall", "identify", "photo.jpg"]).unwrap();
        match cli.command {
            Commands::Identify { matching, .. } => assert_eq!(matching.threshold, ARCFACE_MATCH_THRESHOLD),
            _ => panic!("expected identify"),
        }
    }

    #[test]
    fn test_check_label() {
        assert!(check_label("alice").is_ok());
        assert!(check_label("Mary Ann").is_ok());
        for bad in ["Unknown", "", ".", "..", "../x", "a/b", "a\\b"] {
            assert!(check_label(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn test_store_reference_replaces_other_extension() {
        let dir = tempfile::tempdir().unwrap();
        let faces = dir.path().join("faces");
        let photo = dir.path().join("new.png");
        std::fs::write(&photo, b"png bytes").unwrap();

        let (dest, replaced) = store_reference(&faces, &photo, "alice", "png").unwrap();
        assert_eq!(dest, faces.join("alice.png"));
        assert!(!replaced);

        std::fs::remove_file(&dest).unwrap();
        std::fs::write(faces.join("alice.jpg"), b"old jpeg").unwrap();
        let (dest, replaced) = store_reference(&faces, &photo, "alice", "png").unwrap();
        assert!(replaced);
        assert!(dest.exists());
        assert!(!faces.join("alice.jpg").exists());

        let (_, replaced) = store_reference(&faces, &photo, "alice", "png").unwrap();
        assert!(replaced);
        assert_eq!(std::fs::read(&dest).unwrap(), b"png bytes");
    }

    #[test]
    fn test_replay_flags() {
        let cli = Cli::try_parse_from([
            "rollcall", "replay", "/tmp/frames", "--process-every", "2", "--threshold", "0.5", "--record",
        ])
        .unwrap();
        match cli.command {
            Commands::Replay { process_every, matching, record, downsample, .. } => {
                assert_eq!(process_every, 2);
                assert_eq!(matching.threshold, 0.5);
                assert_eq!(downsample, 1.0);
                assert!(record);
            }
            _ => panic!("expected replay"),
        }
    }
}
