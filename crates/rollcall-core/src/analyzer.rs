//! Face analysis boundary: detection plus embedding extraction.
//!
//! The gallery builder and the frame pipeline only see [`FaceAnalyzer`];
//! [`OnnxFaceAnalyzer`] is the production implementation.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{BoundingBox, Embedding};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("analysis failed: {0}")]
    Other(String),
}

/// One face found in an image, with its embedding.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    /// Location in the coordinate space of the analyzed image.
    pub bbox: BoundingBox,
    pub embedding: Embedding,
}

/// Detects faces in a grayscale image and embeds each of them.
///
/// Results are ordered by descending detection confidence.
pub trait FaceAnalyzer {
    fn analyze(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<DetectedFace>, AnalyzerError>;
}

impl<A: FaceAnalyzer + ?Sized> FaceAnalyzer for Box<A> {
    fn analyze(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<DetectedFace>, AnalyzerError> {
        (**self).analyze(pixels, width, height)
    }
}

/// SCRFD detection followed by ArcFace embedding.
pub struct OnnxFaceAnalyzer {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
    max_faces: usize,
}

impl OnnxFaceAnalyzer {
    /// Load both models. `max_faces` caps how many detections per image get
    /// embedded (the most confident ones).
    pub fn load(
        scrfd_path: &str,
        arcface_path: &str,
        max_faces: usize,
    ) -> Result<Self, AnalyzerError> {
        let detector = FaceDetector::load(scrfd_path)?;
        let recognizer = FaceRecognizer::load(arcface_path)?;
        Ok(Self {
            detector,
            recognizer,
            max_faces: max_faces.max(1),
        })
    }

    pub fn with_detection_confidence(mut self, threshold: f32) -> Self {
        self.detector = self.detector.with_confidence_threshold(threshold);
        self
    }
}

impl FaceAnalyzer for OnnxFaceAnalyzer {
    fn analyze(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<DetectedFace>, AnalyzerError> {
        let boxes = self.detector.detect(pixels, width, height)?;

        let mut faces = Vec::with_capacity(boxes.len().min(self.max_faces));
        for bbox in boxes.into_iter().take(self.max_faces) {
            match self.recognizer.extract(pixels, width, height, &bbox) {
                Ok(embedding) => faces.push(DetectedFace { bbox, embedding }),
                Err(RecognizerError::NoLandmarks) => {
                    tracing::debug!(confidence = bbox.confidence, "skipping face without landmarks");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(faces)
    }
}
