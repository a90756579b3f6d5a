//! The gallery of known faces.
//!
//! Built once at startup, read-only afterwards. Every usable reference
//! image contributes one entry; entries are never merged per identity.

use crate::analyzer::FaceAnalyzer;
use crate::types::{Embedding, Identity};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("gallery directory not found: {0}")]
    NotFound(PathBuf),
    #[error("gallery path is not a directory: {0}")]
    NotADirectory(PathBuf),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("embedding for {identity} has dimension {actual}, gallery uses {expected}")]
    DimensionMismatch {
        identity: Identity,
        expected: usize,
        actual: usize,
    },
}

#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub identity: Identity,
    pub embedding: Embedding,
}

/// Ordered, immutable multiset of (identity, embedding) pairs.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
    /// Distinct identities in first-seen order.
    identities: Vec<Identity>,
}

impl Gallery {
    /// Build a gallery from entries, keeping their order.
    ///
    /// All embeddings must share one dimension.
    pub fn new(entries: Vec<GalleryEntry>) -> Result<Self, GalleryError> {
        if let Some(first) = entries.first() {
            let expected = first.embedding.dimension();
            if let Some(bad) = entries.iter().find(|e| e.embedding.dimension() != expected) {
                return Err(GalleryError::DimensionMismatch {
                    identity: bad.identity.clone(),
                    expected,
                    actual: bad.embedding.dimension(),
                });
            }
        }

        let mut seen = HashSet::new();
        let identities = entries
            .iter()
            .filter(|e| seen.insert(e.identity.clone()))
            .map(|e| e.identity.clone())
            .collect();

        Ok(Self { entries, identities })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Total number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn identity_count(&self) -> usize {
        self.identities.len()
    }

    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    /// Enumerate (identity, embedding) pairs in gallery order.
    pub fn iter(&self) -> impl Iterator<Item = (&Identity, &Embedding)> {
        self.entries.iter().map(|e| (&e.identity, &e.embedding))
    }

    /// Number of entries for one identity.
    pub fn entries_for(&self, identity: &str) -> usize {
        self.entries
            .iter()
            .filter(|e| e.identity.as_str() == identity)
            .count()
    }
}

/// Accumulates entries one reference image at a time.
///
/// Images that yield no face, or that fail analysis, are skipped and
/// counted; they never abort the build.
#[derive(Default)]
pub struct GalleryBuilder {
    entries: Vec<GalleryEntry>,
    skipped: usize,
}

impl GalleryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Analyze one grayscale reference image and keep its most confident face.
    ///
    /// Returns whether an entry was added.
    pub fn add_image<A: FaceAnalyzer + ?Sized>(
        &mut self,
        analyzer: &mut A,
        identity: &Identity,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> bool {
        match analyzer.analyze(pixels, width, height) {
            Ok(faces) => match faces.into_iter().next() {
                Some(face) => {
                    self.entries.push(GalleryEntry {
                        identity: identity.clone(),
                        embedding: face.embedding,
                    });
                    true
                }
                None => {
                    self.skip(identity, "no face found");
                    false
                }
            },
            Err(e) => {
                self.skip(identity, e);
                false
            }
        }
    }

    /// Record a reference image that could not be used.
    pub fn skip(&mut self, identity: &Identity, reason: impl fmt::Display) {
        self.skipped += 1;
        tracing::warn!(%identity, %reason, "skipping gallery image");
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn build(self) -> Result<Gallery, GalleryError> {
        Gallery::new(self.entries)
    }
}

/// Load a gallery from `<root>/<identity>/<image files>`.
///
/// Identity folders and files are visited in name order. Plain files at the
/// top level are ignored. Identities whose images all fail are left out.
pub fn load_directory<A: FaceAnalyzer + ?Sized>(
    root: &Path,
    analyzer: &mut A,
) -> Result<Gallery, GalleryError> {
    if !root.exists() {
        return Err(GalleryError::NotFound(root.to_path_buf()));
    }
    if !root.is_dir() {
        return Err(GalleryError::NotADirectory(root.to_path_buf()));
    }

    let mut builder = GalleryBuilder::new();

    for person_dir in sorted_entries(root)? {
        if !person_dir.is_dir() {
            continue;
        }
        let Some(name) = person_dir.file_name().and_then(|n| n.to_str()) else {
            tracing::warn!(path = %person_dir.display(), "skipping non UTF-8 identity folder");
            continue;
        };
        let identity = Identity::from(name);

        let added = load_identity(&mut builder, analyzer, &identity, &person_dir);
        if added == 0 {
            tracing::info!(%identity, "no usable face images; identity excluded");
        } else {
            tracing::debug!(%identity, images = added, "identity loaded");
        }
    }

    let skipped = builder.skipped();
    let gallery = builder.build()?;
    tracing::info!(
        entries = gallery.len(),
        identities = gallery.identity_count(),
        skipped,
        "gallery loaded"
    );
    Ok(gallery)
}

/// Add every usable image in one identity folder; returns how many were added.
///
/// An unreadable folder is skipped like an unreadable image.
fn load_identity<A: FaceAnalyzer + ?Sized>(
    builder: &mut GalleryBuilder,
    analyzer: &mut A,
    identity: &Identity,
    dir: &Path,
) -> usize {
    let images = match sorted_entries(dir) {
        Ok(images) => images,
        Err(e) => {
            builder.skip(identity, e);
            return 0;
        }
    };

    let mut added = 0usize;
    for image_path in images {
        if !image_path.is_file() {
            continue;
        }
        match image::open(&image_path) {
            Ok(img) => {
                let gray = img.to_luma8();
                let (w, h) = gray.dimensions();
                if builder.add_image(analyzer, identity, gray.as_raw(), w, h) {
                    added += 1;
                }
            }
            Err(e) => builder.skip(identity, format!("{}: {e}", image_path.display())),
        }
    }
    added
}

/// Directory listing in name order. Entries that fail to read are logged and left out.
fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, GalleryError> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|source| GalleryError::Io {
            path: dir.to_path_buf(),
            source,
        })?
        .filter_map(|entry| match entry {
            Ok(e) => Some(e.path()),
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "skipping unreadable directory entry");
                None
            }
        })
        .collect();
    paths.sort();
    Ok(paths)
}
