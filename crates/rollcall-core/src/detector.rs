//! SCRFD face detector via ONNX Runtime.
//!
//! Runs the anchor-free SCRFD model over a letterboxed grayscale frame,
//! decodes the three stride heads and applies NMS. Boxes come back in the
//! coordinate space of the frame that was passed in.

use crate::types::BoundingBox;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_DEFAULT_CONFIDENCE: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}; download det_10g.onnx from insightface and place it in the model dir")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("frame buffer too short: {width}x{height} needs {expected} bytes, got {actual}")]
    InvalidFrame {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Mapping from letterboxed model input back to the source frame.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: usize, height: usize, target: usize) -> Self {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: (target as f32 - new_w) / 2.0,
            pad_y: (target as f32 - new_h) / 2.0,
        }
    }

    fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor indices for one stride: (score, bbox, kps).
type StrideOutputs = (usize, usize, usize);

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    stride_outputs: [StrideOutputs; 3],
    confidence_threshold: f32,
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();

        tracing::info!(path = model_path, outputs = ?output_names, "loaded SCRFD model");

        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let stride_outputs = map_stride_outputs(&output_names);
        tracing::debug!(?stride_outputs, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            stride_outputs,
            confidence_threshold: SCRFD_DEFAULT_CONFIDENCE,
        })
    }

    /// Override the minimum detection score (default 0.5).
    pub fn with_confidence_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    /// Detect faces in a grayscale frame, highest confidence first.
    pub fn detect(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<BoundingBox>, DetectorError> {
        let expected = width as usize * height as usize;
        if width == 0 || height == 0 || frame.len() < expected {
            return Err(DetectorError::InvalidFrame {
                width,
                height,
                expected,
                actual: frame.len(),
            });
        }

        let letterbox = Letterbox::fit(width as usize, height as usize, SCRFD_INPUT_SIZE);
        let input = build_input(frame, width as usize, height as usize, &letterbox);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_outputs[slot];
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| {
                        DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}"))
                    })
            };
            let head = StrideHead {
                stride,
                scores: extract(score_idx, "scores")?,
                bboxes: extract(bbox_idx, "bboxes")?,
                kps: extract(kps_idx, "kps")?,
            };
            candidates.extend(head.decode(&letterbox, self.confidence_threshold));
        }

        Ok(nms(candidates, SCRFD_NMS_THRESHOLD))
    }
}

/// Letterbox a grayscale frame into the 640×640 NCHW float tensor SCRFD expects.
///
/// Bilinear resize; padding uses the mean so it normalizes to zero.
fn build_input(frame: &[u8], width: usize, height: usize, letterbox: &Letterbox) -> Array4<f32> {
    let new_w = (width as f32 * letterbox.scale).round() as usize;
    let new_h = (height as f32 * letterbox.scale).round() as usize;
    let off_x = letterbox.pad_x.floor() as usize;
    let off_y = letterbox.pad_y.floor() as usize;
    let inv = 1.0 / letterbox.scale;

    let mut tensor = Array4::<f32>::from_elem((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE), 0.0);

    for y in 0..new_h.min(SCRFD_INPUT_SIZE - off_y) {
        let sy = (y as f32 + 0.5) * inv - 0.5;
        for x in 0..new_w.min(SCRFD_INPUT_SIZE - off_x) {
            let sx = (x as f32 + 0.5) * inv - 0.5;
            let pixel = sample_bilinear(frame, width, height, sx, sy);
            let v = (pixel.round().clamp(0.0, 255.0) - SCRFD_MEAN) / SCRFD_STD;
            // Grayscale replicated across the three input channels.
            for c in 0..3 {
                tensor[[0, c, y + off_y, x + off_x]] = v;
            }
        }
    }

    tensor
}

/// Bilinear sample with edge clamping.
fn sample_bilinear(frame: &[u8], width: usize, height: usize, sx: f32, sy: f32) -> f32 {
    let x0 = (sx.floor() as i64).clamp(0, width as i64 - 1) as usize;
    let y0 = (sy.floor() as i64).clamp(0, height as i64 - 1) as usize;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let fx = (sx - sx.floor()).clamp(0.0, 1.0);
    let fy = (sy - sy.floor()).clamp(0.0, 1.0);

    let px = |x: usize, y: usize| frame[y * width + x] as f32;
    let top = px(x0, y0) * (1.0 - fx) + px(x1, y0) * fx;
    let bottom = px(x0, y1) * (1.0 - fx) + px(x1, y1) * fx;
    top * (1.0 - fy) + bottom * fy
}

/// Raw outputs of one SCRFD stride level.
struct StrideHead<'a> {
    stride: usize,
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

impl StrideHead<'_> {
    fn decode(&self, letterbox: &Letterbox, threshold: f32) -> Vec<BoundingBox> {
        let grid_w = SCRFD_INPUT_SIZE / self.stride;
        let grid_h = SCRFD_INPUT_SIZE / self.stride;
        let stride = self.stride as f32;

        (0..grid_w * grid_h * SCRFD_ANCHORS_PER_CELL)
            .filter_map(|idx| {
                let score = self.scores.get(idx).copied()?;
                if score <= threshold {
                    return None;
                }
                let offsets = self.bboxes.get(idx * 4..idx * 4 + 4)?;

                let cell = idx / SCRFD_ANCHORS_PER_CELL;
                let ax = (cell % grid_w) as f32 * stride;
                let ay = (cell / grid_w) as f32 * stride;

                let (x1, y1) = letterbox.to_source(ax - offsets[0] * stride, ay - offsets[1] * stride);
                let (x2, y2) = letterbox.to_source(ax + offsets[2] * stride, ay + offsets[3] * stride);

                let landmarks = self.kps.get(idx * 10..idx * 10 + 10).map(|k| {
                    std::array::from_fn(|i| {
                        letterbox.to_source(ax + k[i * 2] * stride, ay + k[i * 2 + 1] * stride)
                    })
                });

                Some(BoundingBox {
                    x: x1,
                    y: y1,
                    width: x2 - x1,
                    height: y2 - y1,
                    confidence: score,
                    landmarks,
                })
            })
            .collect()
    }
}

/// Work out which output tensor carries which stride head.
///
/// Exports name their tensors either "score_8", "bbox_16", "kps_32", ... or
/// with bare numbers; in the latter case the standard order applies:
/// scores 8/16/32, then bboxes, then keypoints.
fn map_stride_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let named: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?, find("kps", s)?)))
        .collect();

    match named {
        Some(found) => [found[0], found[1], found[2]],
        None => {
            tracing::info!(?names, "SCRFD output names not recognized, using positional mapping");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

/// Greedy non-maximum suppression; result is sorted by descending confidence.
fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<BoundingBox> = Vec::with_capacity(detections.len());
    for det in detections {
        if keep.iter().all(|k| k.iou(&det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_bbox(x: f32, y: f32, w: f32, h: f32, conf: f32) -> BoundingBox {
        BoundingBox {
            x, y, width: w, height: h, confidence: conf, landmarks: None,
        }
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let detections = vec![
            make_bbox(5.0, 5.0, 100.0, 100.0, 0.8),
            make_bbox(0.0, 0.0, 100.0, 100.0, 0.9),
            make_bbox(200.0, 200.0, 50.0, 50.0, 0.7),
        ];
        let result = nms(detections, 0.4);
        assert_eq!(result.len(), 2);
        assert!((result[0].confidence - 0.9).abs() < 1e-6);
        assert!((result[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_letterbox_maps_back_to_source() {
        let lb = Letterbox::fit(320, 240, SCRFD_INPUT_SIZE);
        assert!((lb.scale - 2.0).abs() < 1e-6);
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 80.0);

        let (x, y) = lb.to_source(100.0 * lb.scale + lb.pad_x, 50.0 * lb.scale + lb.pad_y);
        assert!((x - 100.0).abs() < 0.1 && (y - 50.0).abs() < 0.1);
    }

    #[test]
    fn test_build_input_pads_with_zero_and_fills_content() {
        let frame = vec![255u8; 320 * 240];
        let lb = Letterbox::fit(320, 240, SCRFD_INPUT_SIZE);
        let tensor = build_input(&frame, 320, 240, &lb);
        assert_eq!(tensor.shape(), &[1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE]);
        // Top padding band
        assert_eq!(tensor[[0, 0, 10, 10]], 0.0);
        // Inside the letterboxed content
        let expected = (255.0 - SCRFD_MEAN) / SCRFD_STD;
        assert!((tensor[[0, 1, 320, 320]] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_decode_stride_filters_by_score() {
        let stride = 32;
        let cells = (SCRFD_INPUT_SIZE / stride) * (SCRFD_INPUT_SIZE / stride);
        let n = cells * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.1f32; n];
        // Anchor 2 → cell 1 → grid position (1, 0)
        scores[2] = 0.9;
        let bboxes = vec![1.0f32; n * 4];
        let kps = vec![0.0f32; n * 10];

        let head = StrideHead { stride, scores: &scores, bboxes: &bboxes, kps: &kps };
        let lb = Letterbox { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };
        let dets = head.decode(&lb, 0.5);

        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        assert_eq!((d.x, d.y), (0.0, -32.0));
        assert_eq!((d.width, d.height), (64.0, 64.0));
        assert_eq!(d.landmarks.unwrap()[0], (32.0, 0.0));
    }

    #[test]
    fn test_map_stride_outputs_named_shuffled() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8",
            "bbox_16", "kps_16", "score_16",
            "bbox_32", "kps_32", "score_32",
        ].iter().map(|s| s.to_string()).collect();

        let m = map_stride_outputs(&names);
        assert_eq!(m, [(2, 0, 1), (5, 3, 4), (8, 6, 7)]);
    }

    #[test]
    fn test_map_stride_outputs_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| (428 + i).to_string()).collect();
        assert_eq!(map_stride_outputs(&names), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_sample_bilinear_midpoint() {
        // 2x1 frame [0, 100]: halfway between is 50
        let frame = [0u8, 100];
        assert!((sample_bilinear(&frame, 2, 1, 0.5, 0.0) - 50.0).abs() < 1e-4);
        // Clamped outside the frame
        assert_eq!(sample_bilinear(&frame, 2, 1, -3.0, 0.0), 0.0);
    }
}
