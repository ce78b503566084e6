//! Face localization.
//!
//! [`FaceLocator`] is the seam the alignment gate calls; [`ScrfdLocator`]
//! implements it with the SCRFD detector via ONNX Runtime (3-stride
//! anchor-free decoding followed by NMS).

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Finds face bounding boxes in a grayscale image.
pub trait FaceLocator {
    /// `gray` is row-major, one byte per pixel, `width` × `height`.
    fn locate(
        &mut self,
        gray: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Scale/padding applied when fitting a frame into the square model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
    scaled_w: u32,
    scaled_h: u32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, target: u32) -> Self {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let scaled_w = ((width as f32 * scale).round() as u32).clamp(1, target);
        let scaled_h = ((height as f32 * scale).round() as u32).clamp(1, target);
        Self {
            scale,
            pad_x: (target - scaled_w) as f32 / 2.0,
            pad_y: (target - scaled_h) as f32 / 2.0,
            scaled_w,
            scaled_h,
        }
    }

    /// Map a point from model-input space back to frame space.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor positions `(score, bbox)` for one stride.
type StrideOutputs = (usize, usize);

/// SCRFD-based face locator.
pub struct ScrfdLocator {
    session: Session,
    strides: [StrideOutputs; 3],
}

impl ScrfdLocator {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            let path = model_path.display().to_string();
            return Err(DetectorError::ModelNotFound(path));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();
        if names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model needs score and bbox outputs for 3 strides, got {} outputs",
                names.len()
            )));
        }

        let strides = map_outputs(&names);
        tracing::info!(
            path = %model_path.display(),
            outputs = ?names,
            ?strides,
            "loaded SCRFD model"
        );

        Ok(Self { session, strides })
    }

    fn input_tensor(
        gray: &[u8],
        width: u32,
        height: u32,
    ) -> Result<(Array4<f32>, Letterbox), DetectorError> {
        let image = GrayImage::from_raw(width, height, gray.to_vec()).ok_or_else(|| {
            DetectorError::InvalidInput(format!(
                "grayscale buffer of {} bytes does not match {width}x{height}",
                gray.len()
            ))
        })?;

        let lb = Letterbox::fit(width, height, SCRFD_INPUT_SIZE);
        let scaled = imageops::resize(&image, lb.scaled_w, lb.scaled_h, FilterType::Triangle);

        let side = SCRFD_INPUT_SIZE as usize;
        // Padding at the mean normalizes to 0.0.
        let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
        let x0 = lb.pad_x.floor() as u32;
        let y0 = lb.pad_y.floor() as u32;
        for (x, y, pixel) in scaled.enumerate_pixels() {
            let v = (pixel.0[0] as f32 - SCRFD_MEAN) / SCRFD_STD;
            let (tx, ty) = ((x + x0) as usize, (y + y0) as usize);
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = v;
            }
        }
        Ok((tensor, lb))
    }
}

impl FaceLocator for ScrfdLocator {
    fn locate(
        &mut self,
        gray: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<BoundingBox>, DetectorError> {
        if width == 0 || height == 0 {
            return Err(DetectorError::InvalidInput("empty frame".into()));
        }
        let (input, lb) = Self::input_tensor(gray, width, height)?;
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.strides[slot];
            let extract_failed = |what: &str, e: ort::Error| {
                DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}"))
            };
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| extract_failed("scores", e))?;
            let (_, boxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| extract_failed("boxes", e))?;
            candidates.extend(decode_stride(scores, boxes, stride, &lb));
        }

        Ok(nms(candidates, SCRFD_NMS_THRESHOLD))
    }
}

/// Resolve which outputs hold scores and boxes for each stride.
///
/// Exports either name tensors `score_8`, `bbox_16`, ... or use opaque
/// numeric names in the canonical order scores[0..3], boxes[3..6].
fn map_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let position = |prefix: &str, stride: usize| {
        let wanted = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let named: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((position("score", s)?, position("bbox", s)?)))
        .collect();

    match named {
        Some(found) => [found[0], found[1], found[2]],
        None => [(0, 3), (1, 4), (2, 5)],
    }
}

/// Decode anchor-free detections for one stride into frame coordinates.
fn decode_stride(scores: &[f32], boxes: &[f32], stride: usize, lb: &Letterbox) -> Vec<BoundingBox> {
    let side = SCRFD_INPUT_SIZE as usize;
    let grid_w = side / stride;
    let anchors = (side / stride) * grid_w * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    (0..anchors)
        .filter_map(|idx| {
            let score = *scores.get(idx)?;
            if score <= SCRFD_CONFIDENCE_THRESHOLD {
                return None;
            }
            let d = boxes.get(idx * 4..idx * 4 + 4)?;
            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let ax = (cell % grid_w) as f32 * step;
            let ay = (cell / grid_w) as f32 * step;

            let (x1, y1) = lb.unmap(ax - d[0] * step, ay - d[1] * step);
            let (x2, y2) = lb.unmap(ax + d[2] * step, ay + d[3] * step);
            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression, highest confidence first.
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

    fn bbox(x: f32, y: f32, w: f32, h: f32, confidence: f32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width: w,
            height: h,
            confidence,
        }
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let result = nms(
            vec![
                bbox(5.0, 5.0, 100.0, 100.0, 0.8),
                bbox(0.0, 0.0, 100.0, 100.0, 0.9),
                bbox(200.0, 200.0, 50.0, 50.0, 0.7),
            ],
            0.4,
        );
        assert_eq!(result.len(), 2);
        assert!((result[0].confidence - 0.9).abs() < 1e-6);
        assert!((result[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_letterbox_wide_frame() {
        let lb = Letterbox::fit(1280, 720, 640);
        assert!((lb.scale - 0.5).abs() < 1e-6);
        assert_eq!((lb.scaled_w, lb.scaled_h), (640, 360));
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 140.0);
    }

    #[test]
    fn test_letterbox_unmap_roundtrip() {
        let lb = Letterbox::fit(320, 240, 640);
        let (x, y) = (100.0f32, 50.0f32);
        let (rx, ry) = lb.unmap(x * lb.scale + lb.pad_x, y * lb.scale + lb.pad_y);
        assert!((rx - x).abs() < 0.01 && (ry - y).abs() < 0.01);
    }

    #[test]
    fn test_map_outputs_named_shuffled() {
        let names: Vec<String> = ["bbox_8", "score_8", "bbox_16", "score_16", "bbox_32", "score_32"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(map_outputs(&names), [(1, 0), (3, 2), (5, 4)]);
    }

    #[test]
    fn test_map_outputs_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(map_outputs(&names), [(0, 3), (1, 4), (2, 5)]);
    }

    #[test]
    fn test_decode_stride_single_anchor() {
        // Identity letterbox; one confident anchor at cell (1, 0) of stride 32.
        let lb = Letterbox {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
            scaled_w: 640,
            scaled_h: 640,
        };
        let anchors = 20 * 20 * 2;
        let mut scores = vec![0.0f32; anchors];
        let mut boxes = vec![0.0f32; anchors * 4];
        let idx = 2; // cell 1 → ax = 32, ay = 0
        scores[idx] = 0.9;
        boxes[idx * 4..idx * 4 + 4].copy_from_slice(&[0.5, 0.0, 1.0, 2.0]);

        let dets = decode_stride(&scores, &boxes, 32, &lb);
        assert_eq!(dets.len(), 1);
        let d = dets[0];
        assert!((d.x - 16.0).abs() < 1e-4);
        assert!((d.y - 0.0).abs() < 1e-4);
        assert!((d.width - 48.0).abs() < 1e-4);
        assert!((d.height - 64.0).abs() < 1e-4);
    }

    #[test]
    fn test_input_tensor_rejects_mismatched_buffer() {
        assert!(matches!(
            ScrfdLocator::input_tensor(&[0u8; 10], 4, 4),
            Err(DetectorError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_input_tensor_pads_with_zero() {
        let (tensor, lb) = ScrfdLocator::input_tensor(&vec![255u8; 64 * 32], 64, 32).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        // Top padding row normalizes to 0.0, image area to (255-127.5)/128.
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        let inside = (lb.pad_y as usize) + 10;
        assert!((tensor[[0, 1, inside, 320]] - 127.5 / 128.0).abs() < 1e-4);
    }

    #[test]
    fn test_load_missing_model() {
        assert!(matches!(
            ScrfdLocator::load(Path::new("/nonexistent/det_10g.onnx")),
            Err(DetectorError::ModelNotFound(_))
        ));
    }
}
