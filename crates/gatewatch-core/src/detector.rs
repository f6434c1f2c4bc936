//! SCRFD face detector via ONNX Runtime.
//!
//! The frame is letterboxed into a square 640x640 input, scores and box
//! offsets are decoded per stride, then overlapping boxes are suppressed.

use crate::types::{BoundingBox, Frame};
use image::imageops::{self, FilterType};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const INPUT_SIZE: u32 = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 128.0;
const SCORE_THRESHOLD: f32 = 0.5;
const NMS_IOU: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detector model not found: {0}")]
    ModelNotFound(String),
    #[error("detector output: {0}")]
    Output(String),
    #[error("frame has invalid dimensions")]
    InvalidFrame,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Maps letterboxed input coordinates back onto the source frame.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> Self {
        let scale = (INPUT_SIZE as f32 / width as f32).min(INPUT_SIZE as f32 / height as f32);
        let (w, h) = scaled_size(width, height, scale);
        Self {
            scale,
            pad_x: ((INPUT_SIZE - w) / 2) as f32,
            pad_y: ((INPUT_SIZE - h) / 2) as f32,
        }
    }

    fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

fn scaled_size(width: u32, height: u32, scale: f32) -> (u32, u32) {
    let w = ((width as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
    let h = ((height as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
    (w, h)
}

/// Score and box tensor positions for one stride.
type StrideOutputs = (usize, usize);

pub struct FaceDetector {
    session: Session,
    outputs: [StrideOutputs; 3],
}

impl FaceDetector {
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 6 {
            return Err(DetectorError::Output(format!(
                "expected score and box tensors for 3 strides, got {} outputs",
                names.len()
            )));
        }
        let outputs = output_layout(&names);
        tracing::info!(path = %model_path.display(), ?outputs, "loaded SCRFD detector");

        Ok(Self { session, outputs })
    }

    /// Detect faces in an RGB frame, highest confidence first.
    pub fn detect(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, DetectorError> {
        let (input, letterbox) = preprocess(frame)?;
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (pos, &stride) in STRIDES.iter().enumerate() {
            let (score_idx, box_idx) = self.outputs[pos];
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::Output(format!("scores/{stride}: {e}")))?;
            let (_, boxes) = outputs[box_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::Output(format!("boxes/{stride}: {e}")))?;
            candidates.extend(decode_stride(scores, boxes, stride, &letterbox, SCORE_THRESHOLD));
        }

        let mut faces = nms(candidates, NMS_IOU);
        for face in &mut faces {
            clamp_to_frame(face, frame.width, frame.height);
        }
        faces.retain(|f| f.area() > 0.0);
        Ok(faces)
    }
}

/// Exports either name tensors `score_8`, `bbox_8`, ... or list them
/// positionally as scores 8/16/32 followed by boxes 8/16/32.
fn output_layout(names: &[String]) -> [StrideOutputs; 3] {
    let find = |kind: &str, stride: usize| {
        let wanted = format!("{kind}_{stride}");
        names.iter().position(|n| *n == wanted)
    };
    let named: Option<Vec<StrideOutputs>> = STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?)))
        .collect();
    match named {
        Some(found) if found.len() == 3 => [found[0], found[1], found[2]],
        _ => [(0, 3), (1, 4), (2, 5)],
    }
}

fn preprocess(frame: &Frame) -> Result<(Array4<f32>, Letterbox), DetectorError> {
    let img = frame.to_image().ok_or(DetectorError::InvalidFrame)?;
    let letterbox = Letterbox::fit(frame.width, frame.height);
    let (w, h) = scaled_size(frame.width, frame.height, letterbox.scale);
    let resized = imageops::resize(&img, w, h, FilterType::Triangle);

    let size = INPUT_SIZE as usize;
    // padding at the mean normalizes to zero
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    let (ox, oy) = (letterbox.pad_x as usize, letterbox.pad_y as usize);
    for (x, y, px) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, oy + y as usize, ox + x as usize]] = (px[c] as f32 - PIXEL_MEAN) / PIXEL_STD;
        }
    }
    Ok((tensor, letterbox))
}

fn decode_stride(
    scores: &[f32],
    boxes: &[f32],
    stride: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<BoundingBox> {
    let grid = INPUT_SIZE as usize / stride;
    let anchors = grid * grid * ANCHORS_PER_CELL;
    let step = stride as f32;

    (0..anchors)
        .filter_map(|idx| {
            let score = *scores.get(idx)?;
            if score <= threshold {
                return None;
            }
            let offsets = boxes.get(idx * 4..idx * 4 + 4)?;
            let cell = idx / ANCHORS_PER_CELL;
            let cx = (cell % grid) as f32 * step;
            let cy = (cell / grid) as f32 * step;

            let (x1, y1) = letterbox.to_frame(cx - offsets[0] * step, cy - offsets[1] * step);
            let (x2, y2) = letterbox.to_frame(cx + offsets[2] * step, cy + offsets[3] * step);
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

/// Greedy non-maximum suppression; output is sorted by confidence.
pub fn nms(mut boxes: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut keep: Vec<BoundingBox> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        if keep.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

fn clamp_to_frame(face: &mut BoundingBox, width: u32, height: u32) {
    let x1 = face.x.clamp(0.0, width as f32);
    let y1 = face.y.clamp(0.0, height as f32);
    let x2 = (face.x + face.width).clamp(0.0, width as f32);
    let y2 = (face.y + face.height).clamp(0.0, height as f32);
    face.x = x1;
    face.y = y1;
    face.width = x2 - x1;
    face.height = y2 - y1;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, y: f32, w: f32, h: f32, confidence: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence }
    }

    #[test]
    fn test_nms_keeps_best_of_overlap() {
        let kept = nms(
            vec![
                bbox(5.0, 5.0, 100.0, 100.0, 0.8),
                bbox(0.0, 0.0, 100.0, 100.0, 0.9),
                bbox(200.0, 200.0, 50.0, 50.0, 0.7),
            ],
            0.4,
        );
        let conf: Vec<f32> = kept.iter().map(|b| b.confidence).collect();
        assert_eq!(conf, vec![0.9, 0.7]);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(Vec::new(), 0.4).is_empty());
    }

    #[test]
    fn test_letterbox_maps_back_to_frame() {
        let lb = Letterbox::fit(320, 240);
        // 320x240 scales by 2 to 640x480, padded 80 rows top and bottom
        assert_eq!(lb.scale, 2.0);
        assert_eq!((lb.pad_x, lb.pad_y), (0.0, 80.0));
        let (x, y) = lb.to_frame(100.0 * 2.0, 50.0 * 2.0 + 80.0);
        assert!((x - 100.0).abs() < 1e-4 && (y - 50.0).abs() < 1e-4);
    }

    #[test]
    fn test_decode_stride_thresholds_and_positions() {
        let lb = Letterbox { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };
        let grid = INPUT_SIZE as usize / 32;
        let anchors = grid * grid * ANCHORS_PER_CELL;
        let mut scores = vec![0.1f32; anchors];
        let mut boxes = vec![0.0f32; anchors * 4];
        // second anchor of cell (1, 0)
        let idx = ANCHORS_PER_CELL + 1;
        scores[idx] = 0.95;
        boxes[idx * 4..idx * 4 + 4].copy_from_slice(&[0.5, 0.5, 1.0, 1.0]);

        let out = decode_stride(&scores, &boxes, 32, &lb, 0.5);
        assert_eq!(out.len(), 1);
        let face = out[0];
        assert_eq!((face.x, face.y), (16.0, -16.0));
        assert_eq!((face.width, face.height), (48.0, 48.0));
    }

    #[test]
    fn test_clamp_to_frame() {
        let mut face = bbox(-10.0, 20.0, 50.0, 100.0, 0.9);
        clamp_to_frame(&mut face, 64, 48);
        assert_eq!((face.x, face.y, face.width, face.height), (0.0, 20.0, 40.0, 28.0));
    }

    #[test]
    fn test_output_layout_named() {
        let names: Vec<String> = ["bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32", "score_32"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(output_layout(&names), [(2, 0), (5, 3), (8, 6)]);
    }

    #[test]
    fn test_output_layout_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| (400 + i).to_string()).collect();
        assert_eq!(output_layout(&names), [(0, 3), (1, 4), (2, 5)]);
    }

    #[test]
    fn test_preprocess_pads_with_zero() {
        let frame = Frame::new(vec![255u8; 64 * 32 * 3], 64, 32);
        let (tensor, lb) = preprocess(&frame).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert_eq!(lb.pad_y, 160.0);
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        let inside = tensor[[0, 1, 320, 320]];
        assert!((inside - (255.0 - PIXEL_MEAN) / PIXEL_STD).abs() < 1e-3);
    }
}
