//! Replay a directory of still images as a frame stream.
//!
//! Useful for dry runs without a camera: files are served in name order and
//! the stream ends after the last one.

use crate::frame::Frame;
use crate::source::{FrameSource, SourceError};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "bmp", "pgm", "webp"];

pub struct ImageSequence {
    pending: VecDeque<PathBuf>,
    sequence: u32,
}

impl ImageSequence {
    /// Collect the image files directly inside `dir`.
    pub fn open(dir: &Path) -> std::io::Result<Self> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && has_image_extension(p))
            .collect();
        paths.sort();

        tracing::info!(dir = %dir.display(), frames = paths.len(), "replay source opened");

        Ok(Self::from_paths(paths))
    }

    pub fn from_paths(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            pending: paths.into_iter().collect(),
            sequence: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

impl FrameSource for ImageSequence {
    fn next_frame(&mut self) -> Result<Frame, SourceError> {
        let path = self.pending.pop_front().ok_or(SourceError::EndOfStream)?;
        let sequence = self.sequence;
        self.sequence += 1;

        let gray = image::open(&path)
            .map_err(|e| SourceError::Transient(format!("{}: {e}", path.display())))?
            .to_luma8();
        let (width, height) = gray.dimensions();

        Ok(Frame::from_gray(gray.into_raw(), width, height, sequence))
    }
}
