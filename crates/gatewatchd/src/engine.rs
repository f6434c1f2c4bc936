//! Camera capture and face-model inference on a dedicated OS thread.
//!
//! Both are blocking, so they stay off the async runtime. Async callers talk
//! to the thread through [`EngineHandle`], which is the daemon's frame source
//! and embedding source.

use async_trait::async_trait;
use gatewatch_core::model::FaceModel;
use gatewatch_core::source::{EmbeddingSource, FrameSource, SourceError};
use gatewatch_core::types::{Detection, Frame};
use gatewatch_hw::frame::is_dark_frame;
use gatewatch_hw::{Camera, CaptureError};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

const DARK_FRAME_RATIO: f32 = 0.95;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CaptureError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
}

enum EngineRequest {
    LoadModel {
        reply: oneshot::Sender<Result<(), SourceError>>,
    },
    Capture {
        reply: oneshot::Sender<Result<Frame, SourceError>>,
    },
    Detect {
        frame: Frame,
        reply: oneshot::Sender<Result<Vec<Detection>, SourceError>>,
    },
}

/// Clone-safe handle to the engine thread. The thread exits once every
/// handle is dropped.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    models_loaded: Arc<AtomicBool>,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, SourceError>>) -> EngineRequest,
    ) -> Result<T, SourceError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| SourceError::Closed)?;
        reply_rx.await.map_err(|_| SourceError::Closed)?
    }

    /// Grab one frame. Dark frames come back as `FrameUnavailable`.
    pub async fn capture(&self) -> Result<Frame, SourceError> {
        self.call(|reply| EngineRequest::Capture { reply }).await
    }

    pub fn models_loaded(&self) -> bool {
        self.models_loaded.load(Ordering::Acquire)
    }
}

#[async_trait]
impl FrameSource for EngineHandle {
    async fn next_frame(&mut self) -> Result<Frame, SourceError> {
        self.capture().await
    }
}

#[async_trait]
impl EmbeddingSource for EngineHandle {
    async fn load(&mut self) -> Result<(), SourceError> {
        self.call(|reply| EngineRequest::LoadModel { reply }).await
    }

    async fn infer(&mut self, frame: &Frame) -> Result<Vec<Detection>, SourceError> {
        let frame = frame.clone();
        self.call(|reply| EngineRequest::Detect { frame, reply }).await
    }
}

/// Open the camera, discard warmup frames, then serve requests on a
/// dedicated thread. Models load on the first `load` request.
pub fn spawn_engine(
    camera_device: &str,
    width: u32,
    height: u32,
    model_dir: &Path,
    warmup_frames: usize,
) -> Result<EngineHandle, EngineError> {
    let camera = Camera::open(camera_device, width, height)?;
    if let Err(e) = camera.warm_up(warmup_frames) {
        tracing::warn!(error = %e, "warmup capture failed");
    }

    let mut model = FaceModel::new(model_dir);
    let models_loaded = Arc::new(AtomicBool::new(false));
    let loaded_flag = models_loaded.clone();
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("gatewatch-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::LoadModel { reply } => {
                        let result = model.load();
                        loaded_flag.store(result.is_ok(), Ordering::Release);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Capture { reply } => {
                        let _ = reply.send(capture(&camera));
                    }
                    EngineRequest::Detect { frame, reply } => {
                        let _ = reply.send(model.detect(&frame));
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx, models_loaded })
}

fn capture(camera: &Camera) -> Result<Frame, SourceError> {
    let frame = camera
        .capture_frame()
        .map_err(|e| SourceError::FrameUnavailable(e.to_string()))?;
    if is_dark_frame(&frame, DARK_FRAME_RATIO) {
        return Err(SourceError::FrameUnavailable("dark frame".into()));
    }
    Ok(frame)
}
