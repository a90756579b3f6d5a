use crate::frame::Frame;
use thiserror::Error;

/// Why a frame could not be read.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// This frame is lost but the source may recover; skip it.
    #[error("transient read failure: {0}")]
    Transient(String),
    /// The device went away mid-session.
    #[error("source disconnected: {0}")]
    Disconnected(String),
    /// The source has no more frames.
    #[error("end of stream")]
    EndOfStream,
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Transient(_))
    }
}

/// Blocking supplier of frames, read in arrival order.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Frame, SourceError>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn next_frame(&mut self) -> Result<Frame, SourceError> {
        (**self).next_frame()
    }
}
