//! Descriptor store: the gallery of known identities.
//!
//! The gallery is an immutable, versioned snapshot behind an `Arc`. Readers
//! clone the `Arc` and keep matching against it for as long as they like;
//! rebuilds and registrations assemble a complete new snapshot and swap it
//! in under a short write lock, so no reader ever observes a mix of old and
//! new identities.

use crate::extractor::{ExtractorError, FaceExtractor};
use crate::frame::{Frame, FrameError};
use crate::matcher::UNKNOWN_LABEL;
use crate::types::{Embedding, Identity};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;

/// Reference image extensions picked up from a gallery directory.
pub const SUPPORTED_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("embedding dimension mismatch for '{label}': gallery is {expected}-d, got {actual}-d")]
    DimensionMismatch {
        label: String,
        expected: usize,
        actual: usize,
    },
    #[error("reference image for '{label}' is unusable: {reason}")]
    Unusable { label: String, reason: UnusableReason },
    #[error("extraction failed: {0}")]
    Extractor(#[from] ExtractorError),
    #[error("reading gallery directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame: {0}")]
    Frame(#[from] FrameError),
}

/// Why a reference image did not produce an identity.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
pub enum UnusableReason {
    #[error("could not load image: {0}")]
    Load(String),
    #[error("no face detected")]
    NoFace,
    #[error("face could not be embedded")]
    NoEmbedding,
    #[error("label is reserved for unmatched faces")]
    ReservedLabel,
}

/// A labelled reference image on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceImage {
    pub label: String,
    pub path: PathBuf,
}

impl ReferenceImage {
    /// Derive the label from the file stem (`faces/alice.jpg` → `alice`).
    pub fn from_path(path: impl Into<PathBuf>) -> Option<Self> {
        let path = path.into();
        let label = path.file_stem()?.to_str()?.to_string();
        if label.is_empty() {
            return None;
        }
        Some(Self { label, path })
    }
}

/// Decodes reference images into grayscale frames.
pub trait ReferenceImageLoader {
    fn load(&self, path: &Path) -> Result<Frame, LoadError>;
}

/// Loads image files with the `image` crate.
pub struct ImageFileLoader;

impl ReferenceImageLoader for ImageFileLoader {
    fn load(&self, path: &Path) -> Result<Frame, LoadError> {
        let image = image::open(path)?.to_luma8();
        Ok(Frame::from_luma(image)?)
    }
}

/// List reference images in `dir`, sorted by file name.
///
/// A missing directory yields an empty list. When two files share a label
/// (`alice.jpg`, `alice.png`) the later one in sort order wins.
pub fn scan_directory(dir: &Path) -> Result<Vec<ReferenceImage>, GalleryError> {
    if !dir.exists() {
        tracing::warn!(dir = %dir.display(), "gallery directory does not exist");
        return Ok(Vec::new());
    }

    let io_err = |source| GalleryError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        let supported = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| SUPPORTED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
        if supported && path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();

    let mut references: Vec<ReferenceImage> = Vec::with_capacity(paths.len());
    for reference in paths.into_iter().filter_map(ReferenceImage::from_path) {
        if let Some(pos) = references.iter().position(|r| r.label == reference.label) {
            tracing::warn!(
                label = %reference.label,
                replaced = %references[pos].path.display(),
                with = %reference.path.display(),
                "duplicate reference label"
            );
            references[pos] = reference;
        } else {
            references.push(reference);
        }
    }
    Ok(references)
}

/// An immutable gallery snapshot.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    version: u64,
    dimension: Option<usize>,
    identities: Vec<Identity>,
}

impl Gallery {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a gallery from identities. Later duplicates of a label replace
    /// the earlier embedding in place.
    pub fn from_identities(identities: Vec<Identity>) -> Result<Self, GalleryError> {
        let mut gallery = Self::empty();
        for identity in identities {
            gallery.upsert(identity)?;
        }
        Ok(gallery)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Embedding dimension shared by every identity, `None` while empty.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.identities.iter().map(|i| i.label.as_str())
    }

    pub fn get(&self, label: &str) -> Option<&Identity> {
        self.identities.iter().find(|i| i.label == label)
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    fn upsert(&mut self, identity: Identity) -> Result<(), GalleryError> {
        let actual = identity.embedding.dimension();
        match self.dimension {
            Some(expected) if expected != actual => {
                return Err(GalleryError::DimensionMismatch {
                    label: identity.label,
                    expected,
                    actual,
                });
            }
            _ => self.dimension = Some(actual),
        }
        match self.identities.iter_mut().find(|i| i.label == identity.label) {
            Some(existing) => existing.embedding = identity.embedding,
            None => self.identities.push(identity),
        }
        Ok(())
    }
}

/// A reference image that did not yield an identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnusableImage {
    pub label: String,
    pub path: PathBuf,
    pub reason: UnusableReason,
}

/// A reference image holding more than one face; the first was used.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MultiFaceWarning {
    pub label: String,
    pub path: PathBuf,
    pub faces: usize,
}

/// Outcome of [`DescriptorStore::rebuild`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RebuildReport {
    /// Version of the snapshot that was swapped in.
    pub version: u64,
    pub usable: Vec<String>,
    pub unusable: Vec<UnusableImage>,
    pub multi_face: Vec<MultiFaceWarning>,
    /// Labels whose new image was unusable but whose previous identity was kept.
    pub carried_forward: Vec<String>,
}

impl RebuildReport {
    pub fn usable_count(&self) -> usize {
        self.usable.len()
    }

    pub fn unusable_count(&self) -> usize {
        self.unusable.len()
    }
}

/// Outcome of [`DescriptorStore::register`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegisterOutcome {
    pub version: u64,
    pub label: String,
    /// Faces found in the image; above 1 means the first face was used.
    pub faces: usize,
}

enum Evaluated {
    Usable { embedding: Embedding, faces: usize },
    Unusable(UnusableReason),
}

/// Owns the current gallery snapshot.
pub struct DescriptorStore {
    current: RwLock<Arc<Gallery>>,
    /// Serializes writers so a registration cannot be lost to a concurrent rebuild.
    writer: Mutex<()>,
    /// Dimension every embedding must have; fixed by the model in use.
    fixed_dimension: Option<usize>,
}

impl Default for DescriptorStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DescriptorStore {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(Gallery::empty())),
            writer: Mutex::new(()),
            fixed_dimension: None,
        }
    }

    /// A store that rejects embeddings whose length is not `dimension`.
    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            fixed_dimension: Some(dimension),
            ..Self::new()
        }
    }

    /// The current snapshot. Cheap: one `Arc` clone.
    pub fn snapshot(&self) -> Arc<Gallery> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Current `(label, embedding)` pairs.
    pub fn identities(&self) -> Vec<Identity> {
        self.snapshot().identities().to_vec()
    }

    /// Replace the whole gallery with identities built from `references`.
    ///
    /// Unusable images are skipped and reported. If a label's new image is
    /// unusable but the previous gallery knew that label, its old identity is
    /// kept. Images with several faces use the first (strongest) detection.
    /// A dimension mismatch aborts the rebuild and leaves the gallery as is.
    pub fn rebuild<E, L>(
        &self,
        extractor: &mut E,
        loader: &L,
        references: &[ReferenceImage],
    ) -> Result<RebuildReport, GalleryError>
    where
        E: FaceExtractor + ?Sized,
        L: ReferenceImageLoader + ?Sized,
    {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = self.snapshot();

        let mut next = Gallery::empty();
        let mut report = RebuildReport::default();

        for reference in references {
            match evaluate(extractor, loader, reference)? {
                Evaluated::Usable { embedding, faces } => {
                    if faces > 1 {
                        tracing::warn!(
                            label = %reference.label,
                            path = %reference.path.display(),
                            faces,
                            "reference image has several faces; using the first"
                        );
                        report.multi_face.push(MultiFaceWarning {
                            label: reference.label.clone(),
                            path: reference.path.clone(),
                            faces,
                        });
                    }
                    next.upsert(Identity {
                        label: reference.label.clone(),
                        embedding,
                    })?;
                    if !report.usable.contains(&reference.label) {
                        report.usable.push(reference.label.clone());
                    }
                }
                Evaluated::Unusable(reason) => {
                    tracing::warn!(
                        label = %reference.label,
                        path = %reference.path.display(),
                        %reason,
                        "skipping unusable reference image"
                    );
                    report.unusable.push(UnusableImage {
                        label: reference.label.clone(),
                        path: reference.path.clone(),
                        reason,
                    });
                }
            }
        }

        for unusable in &report.unusable {
            if next.get(&unusable.label).is_some() {
                continue;
            }
            if let Some(old) = previous.get(&unusable.label) {
                next.upsert(old.clone())?;
                report.carried_forward.push(unusable.label.clone());
            }
        }

        self.check_dimension(&next, &previous)?;

        next.version = previous.version + 1;
        report.version = next.version;
        let count = next.len();
        self.swap(next);

        tracing::info!(
            version = report.version,
            identities = count,
            usable = report.usable_count(),
            unusable = report.unusable_count(),
            carried_forward = report.carried_forward.len(),
            "gallery rebuilt"
        );
        Ok(report)
    }

    /// Add or replace a single identity from one reference image.
    ///
    /// An unusable image is an error and leaves the gallery untouched.
    pub fn register<E, L>(
        &self,
        extractor: &mut E,
        loader: &L,
        reference: &ReferenceImage,
    ) -> Result<RegisterOutcome, GalleryError>
    where
        E: FaceExtractor + ?Sized,
        L: ReferenceImageLoader + ?Sized,
    {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let (embedding, faces) = match evaluate(extractor, loader, reference)? {
            Evaluated::Usable { embedding, faces } => (embedding, faces),
            Evaluated::Unusable(reason) => {
                return Err(GalleryError::Unusable {
                    label: reference.label.clone(),
                    reason,
                })
            }
        };
        if faces > 1 {
            tracing::warn!(label = %reference.label, faces, "registration image has several faces; using the first");
        }

        let previous = self.snapshot();
        let mut next = (*previous).clone();
        let replaced = next.get(&reference.label).is_some();
        next.upsert(Identity {
            label: reference.label.clone(),
            embedding,
        })?;
        self.check_dimension(&next, &previous)?;

        next.version = previous.version + 1;
        let outcome = RegisterOutcome {
            version: next.version,
            label: reference.label.clone(),
            faces,
        };
        self.swap(next);

        tracing::info!(label = %outcome.label, version = outcome.version, replaced, "identity registered");
        Ok(outcome)
    }

    fn check_dimension(&self, next: &Gallery, previous: &Gallery) -> Result<(), GalleryError> {
        let (Some(expected), Some(actual)) = (
            self.fixed_dimension.or(previous.dimension()),
            next.dimension(),
        ) else {
            return Ok(());
        };
        if expected == actual {
            return Ok(());
        }
        let label = next.labels().next().unwrap_or_default().to_string();
        Err(GalleryError::DimensionMismatch {
            label,
            expected,
            actual,
        })
    }

    fn swap(&self, next: Gallery) {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *current = Arc::new(next);
    }
}

/// Load one reference image and embed its first face.
fn evaluate<E, L>(
    extractor: &mut E,
    loader: &L,
    reference: &ReferenceImage,
) -> Result<Evaluated, GalleryError>
where
    E: FaceExtractor + ?Sized,
    L: ReferenceImageLoader + ?Sized,
{
    if reference.label == UNKNOWN_LABEL {
        return Ok(Evaluated::Unusable(UnusableReason::ReservedLabel));
    }
    let frame = match loader.load(&reference.path) {
        Ok(frame) => frame,
        Err(e) => return Ok(Evaluated::Unusable(UnusableReason::Load(e.to_string()))),
    };

    let regions = extractor.detect(&frame)?;
    let Some(first) = regions.first() else {
        return Ok(Evaluated::Unusable(UnusableReason::NoFace));
    };

    let detection = extractor
        .embed(&frame, std::slice::from_ref(first))?
        .into_iter()
        .next();
    Ok(match detection {
        Some(d) => Evaluated::Usable {
            embedding: d.embedding,
            faces: regions.len(),
        },
        None => Evaluated::Unusable(UnusableReason::NoEmbedding),
    })
}
