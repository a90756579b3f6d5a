//! rollcall-core: face gallery, matching and attendance state.
//!
//! Faces are detected with SCRFD and embedded with ArcFace (ONNX Runtime,
//! CPU). Each embedding is matched against the gallery by Euclidean
//! distance, and the first match of a known identity settles its
//! attendance for the day.

pub mod alignment;
pub mod analyzer;
pub mod attendance;
pub mod clock;
pub mod detector;
pub mod gallery;
pub mod matcher;
pub mod recognizer;
pub mod types;

pub use analyzer::{AnalyzerError, DetectedFace, FaceAnalyzer, OnnxFaceAnalyzer};
pub use attendance::{
    AttendanceLedger, AttendanceRecord, AttendanceStatus, ExportRow, LedgerSnapshot,
    LedgerSummary, RecordOutcome, StatusKind, TransitionEvent, ARRIVAL_FORMAT,
};
pub use clock::{Clock, FixedClock, SystemClock};
pub use gallery::{Gallery, GalleryBuilder, GalleryEntry, GalleryError};
pub use matcher::{EuclideanMatcher, MatchResult, Matcher};
pub use types::{BoundingBox, Embedding, Identity};
