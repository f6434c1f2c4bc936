//! ArcFace face embeddings via ONNX Runtime.
//!
//! The face box is widened to a square, cropped from the RGB frame and
//! resized to 112x112 before inference. Embeddings are L2-normalized.

use crate::types::{BoundingBox, Embedding};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const INPUT_SIZE: u32 = 112;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 127.5;
const EMBEDDING_DIM: usize = 512;
const MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("recognizer model not found: {0}")]
    ModelNotFound(String),
    #[error("recognizer output: {0}")]
    Output(String),
    #[error("face box lies outside the frame")]
    EmptyCrop,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    pub fn load(model_path: &Path) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }
        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;
        tracing::info!(path = %model_path.display(), "loaded ArcFace recognizer");
        Ok(Self { session })
    }

    /// Embed the face at `face` within `image`.
    pub fn embed(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, RecognizerError> {
        let crop = square_crop(image, face).ok_or(RecognizerError::EmptyCrop)?;
        let input = preprocess(&crop);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::Output(e.to_string()))?;

        if raw.len() != EMBEDDING_DIM {
            return Err(RecognizerError::Output(format!(
                "expected {EMBEDDING_DIM} values, got {}",
                raw.len()
            )));
        }
        Ok(Embedding {
            values: l2_normalize(raw.to_vec()),
            model_version: Some(MODEL_VERSION.to_string()),
        })
    }
}

/// Square crop centred on the face, clamped to the image, resized to the
/// model input.
fn square_crop(image: &RgbImage, face: &BoundingBox) -> Option<RgbImage> {
    let (iw, ih) = (image.width() as f32, image.height() as f32);
    let side = face.width.max(face.height);
    let cx = face.x + face.width / 2.0;
    let cy = face.y + face.height / 2.0;

    let x0 = (cx - side / 2.0).max(0.0);
    let y0 = (cy - side / 2.0).max(0.0);
    let x1 = (cx + side / 2.0).min(iw);
    let y1 = (cy + side / 2.0).min(ih);
    if x1 - x0 < 1.0 || y1 - y0 < 1.0 {
        return None;
    }

    let (x, y) = (x0 as u32, y0 as u32);
    let w = ((x1 - x0) as u32).clamp(1, image.width() - x);
    let h = ((y1 - y0) as u32).clamp(1, image.height() - y);
    let crop = imageops::crop_imm(image, x, y, w, h).to_image();
    Some(imageops::resize(&crop, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle))
}

fn preprocess(face: &RgbImage) -> Array4<f32> {
    let size = INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, px) in face.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (px[c] as f32 - PIXEL_MEAN) / PIXEL_STD;
        }
    }
    tensor
}

fn l2_normalize(values: Vec<f32>) -> Vec<f32> {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.into_iter().map(|v| v / norm).collect()
    } else {
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: 0.9 }
    }

    #[test]
    fn test_square_crop_resizes_to_input() {
        let img = RgbImage::from_pixel(200, 100, image::Rgb([10, 20, 30]));
        let crop = square_crop(&img, &bbox(50.0, 20.0, 40.0, 60.0)).unwrap();
        assert_eq!(crop.dimensions(), (INPUT_SIZE, INPUT_SIZE));
        assert_eq!(crop.get_pixel(56, 56).0, [10, 20, 30]);
    }

    #[test]
    fn test_square_crop_outside_image() {
        let img = RgbImage::new(50, 50);
        assert!(square_crop(&img, &bbox(80.0, 80.0, 10.0, 10.0)).is_none());
    }

    #[test]
    fn test_preprocess_keeps_channel_order() {
        let img = RgbImage::from_pixel(INPUT_SIZE, INPUT_SIZE, image::Rgb([255, 128, 0]));
        let t = preprocess(&img);
        assert_eq!(t.shape(), &[1, 3, 112, 112]);
        assert!((t[[0, 0, 5, 5]] - 1.0).abs() < 1e-6);
        assert!((t[[0, 1, 5, 5]] - (0.5 / 127.5)).abs() < 1e-6);
        assert!((t[[0, 2, 5, 5]] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6 && (v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }
}
