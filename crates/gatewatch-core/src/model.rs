//! The ONNX detector and recognizer paired into one embedding model.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::source::SourceError;
use crate::types::{Detection, Frame};
use std::path::{Path, PathBuf};

pub const DETECTOR_MODEL: &str = "det_10g.onnx";
pub const RECOGNIZER_MODEL: &str = "w600k_r50.onnx";

impl From<DetectorError> for SourceError {
    fn from(e: DetectorError) -> Self {
        match e {
            DetectorError::ModelNotFound(path) => SourceError::ModelLoad(format!("missing {path}")),
            other => SourceError::Detection(other.to_string()),
        }
    }
}

impl From<RecognizerError> for SourceError {
    fn from(e: RecognizerError) -> Self {
        match e {
            RecognizerError::ModelNotFound(path) => SourceError::ModelLoad(format!("missing {path}")),
            other => SourceError::Detection(other.to_string()),
        }
    }
}

struct Loaded {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

/// SCRFD boxes plus ArcFace embeddings. Blocking; run it off the async runtime.
pub struct FaceModel {
    model_dir: PathBuf,
    loaded: Option<Loaded>,
}

impl FaceModel {
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
            loaded: None,
        }
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    pub fn load(&mut self) -> Result<(), SourceError> {
        if self.loaded.is_some() {
            return Ok(());
        }
        let detector = FaceDetector::load(&self.model_dir.join(DETECTOR_MODEL))?;
        let recognizer = FaceRecognizer::load(&self.model_dir.join(RECOGNIZER_MODEL))?;
        self.loaded = Some(Loaded { detector, recognizer });
        Ok(())
    }

    /// Detect and embed every face in `frame`, in detector order.
    pub fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, SourceError> {
        let loaded = self.loaded.as_mut().ok_or(SourceError::NotLoaded)?;
        let image = match frame.to_image() {
            Some(image) => image,
            None => return Ok(Vec::new()),
        };

        let faces = loaded.detector.detect(frame)?;
        let mut detections = Vec::with_capacity(faces.len());
        for bbox in faces {
            match loaded.recognizer.embed(&image, &bbox) {
                Ok(embedding) => detections.push(Detection {
                    bbox,
                    embedding,
                    captured_at: frame.captured_at,
                }),
                Err(RecognizerError::EmptyCrop) => {
                    tracing::debug!(?bbox, "face crop empty; dropped");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_before_load() {
        let mut model = FaceModel::new("/nonexistent");
        let frame = Frame::new(vec![0u8; 12], 2, 2);
        assert!(matches!(model.detect(&frame), Err(SourceError::NotLoaded)));
    }

    #[test]
    fn test_missing_weights_fail_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut model = FaceModel::new(dir.path());
        match model.load() {
            Err(SourceError::ModelLoad(msg)) => assert!(msg.contains(DETECTOR_MODEL)),
            other => panic!("expected ModelLoad, got {other:?}"),
        }
        assert!(!model.is_loaded());
    }
}
