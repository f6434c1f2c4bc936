//! Boundary to the frame producer and the face-embedding model.

use crate::types::{Detection, Frame};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("model load failed: {0}")]
    ModelLoad(String),
    #[error("model not loaded")]
    NotLoaded,
    #[error("detection failed: {0}")]
    Detection(String),
    #[error("frame unavailable: {0}")]
    FrameUnavailable(String),
    #[error("source closed")]
    Closed,
}

/// Produces frames from a live video stream.
#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self) -> Result<Frame, SourceError>;
}

/// The external face model: finds faces and embeds them.
#[async_trait]
pub trait EmbeddingSource: Send {
    /// One-time model initialisation.
    async fn load(&mut self) -> Result<(), SourceError>;
    /// Run the model on a frame already checked for validity.
    async fn infer(&mut self, frame: &Frame) -> Result<Vec<Detection>, SourceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelState {
    Unloaded,
    Ready,
    /// Load failed; terminal.
    Failed,
}

/// Guards an [`EmbeddingSource`]: no inference before a successful load, no
/// inference on frames without pixels.
pub struct EmbeddingAdapter<S> {
    source: S,
    state: ModelState,
}

impl<S: EmbeddingSource> EmbeddingAdapter<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            state: ModelState::Unloaded,
        }
    }

    /// Load the model once. A failure is terminal: later calls return the
    /// same outcome without retrying.
    pub async fn load(&mut self) -> bool {
        match self.state {
            ModelState::Ready => return true,
            ModelState::Failed => return false,
            ModelState::Unloaded => {}
        }
        match self.source.load().await {
            Ok(()) => {
                tracing::info!("embedding model loaded");
                self.state = ModelState::Ready;
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "embedding model failed to load; pipeline disabled");
                self.state = ModelState::Failed;
                false
            }
        }
    }

    /// Detect faces. Invalid frames yield no detections without touching the model.
    pub async fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, SourceError> {
        if self.state != ModelState::Ready {
            return Err(SourceError::NotLoaded);
        }
        if !frame.is_valid() {
            tracing::debug!(width = frame.width, height = frame.height, "skipping invalid frame");
            return Ok(Vec::new());
        }
        self.source.infer(frame).await
    }

    pub fn state(&self) -> ModelState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ModelState::Ready
    }

    pub fn inner(&self) -> &S {
        &self.source
    }
}
