//! rollcall-hw: frame sources for the attendance pipeline.
//!
//! Provides V4L2 camera capture, replay of still images from a directory,
//! and the grayscale [`Frame`] type both produce.

pub mod camera;
pub mod frame;
pub mod replay;
pub mod source;

pub use camera::{Camera, CameraError, PixelFormat};
pub use frame::Frame;
pub use replay::ImageSequence;
pub use source::{FrameSource, SourceError};
