//! Test doubles for the pipeline's collaborators.

use crate::identity::{Attendance, IdentityService, ServiceError, Visitor};
use crate::source::{EmbeddingSource, FrameSource, SourceError};
use crate::store::{CacheEntry, DurableStore, StoreError};
use crate::types::{BoundingBox, Detection, Embedding, Frame};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

pub fn detection(values: &[f32]) -> Detection {
    detection_at(values, BoundingBox { x: 8.0, y: 8.0, width: 16.0, height: 16.0, confidence: 0.9 })
}

pub fn detection_at(values: &[f32], bbox: BoundingBox) -> Detection {
    Detection {
        bbox,
        embedding: Embedding::new(values.to_vec()),
        captured_at: chrono::Utc::now(),
    }
}

pub fn blank_frame() -> Frame {
    Frame::new(vec![96u8; 64 * 48 * 3], 64, 48)
}

/// Scripted reply from [`FakeService`].
#[derive(Debug, Clone)]
pub enum Reply {
    Visitor(Visitor),
    NoMatch,
    Fail,
    Reject(String),
}

impl Reply {
    pub fn visitor(name: &str) -> Self {
        Reply::Visitor(Visitor {
            full_name: name.to_string(),
            nik: None,
            company_name: None,
            attendance: Some(Attendance::default()),
        })
    }
}

#[derive(Default)]
struct ServiceLog {
    script: VecDeque<Reply>,
    identify_images: Vec<String>,
    attendance_images: Vec<String>,
}

/// In-memory [`IdentityService`] that records every call.
pub struct FakeService {
    log: Mutex<ServiceLog>,
    fallback: Reply,
    latency: Duration,
}

impl FakeService {
    pub fn always(reply: Reply) -> Self {
        Self::scripted_with_fallback(Vec::new(), reply)
    }

    /// Replies in order, then keeps failing.
    pub fn scripted(replies: Vec<Reply>) -> Self {
        Self::scripted_with_fallback(replies, Reply::Fail)
    }

    fn scripted_with_fallback(replies: Vec<Reply>, fallback: Reply) -> Self {
        Self {
            log: Mutex::new(ServiceLog {
                script: replies.into(),
                ..Default::default()
            }),
            fallback,
            latency: Duration::ZERO,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn identify_calls(&self) -> usize {
        self.log.lock().identify_images.len()
    }

    pub fn identify_images(&self) -> Vec<String> {
        self.log.lock().identify_images.clone()
    }

    pub fn attendance_calls(&self) -> usize {
        self.log.lock().attendance_images.len()
    }

    fn next_reply(&self) -> Reply {
        self.log
            .lock()
            .script
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    async fn attendance(&self, image: &str) -> Result<Visitor, ServiceError> {
        self.log.lock().attendance_images.push(image.to_string());
        self.delay().await;
        match self.next_reply() {
            Reply::Visitor(v) => Ok(v),
            Reply::Reject(msg) => Err(ServiceError::Rejected(msg)),
            Reply::NoMatch => Err(ServiceError::InvalidResponse("attendance: missing visitor".into())),
            Reply::Fail => Err(ServiceError::Status { status: 503, message: "unavailable".into() }),
        }
    }
}

#[async_trait]
impl IdentityService for FakeService {
    async fn identify(&self, image: &str) -> Result<Option<Visitor>, ServiceError> {
        self.log.lock().identify_images.push(image.to_string());
        self.delay().await;
        match self.next_reply() {
            Reply::Visitor(v) => Ok(Some(v)),
            Reply::NoMatch => Ok(None),
            Reply::Reject(msg) => Err(ServiceError::Rejected(msg)),
            Reply::Fail => Err(ServiceError::Status { status: 503, message: "unavailable".into() }),
        }
    }

    async fn check_in(&self, image: &str) -> Result<Visitor, ServiceError> {
        self.attendance(image).await
    }

    async fn check_out(&self, image: &str) -> Result<Visitor, ServiceError> {
        self.attendance(image).await
    }
}

#[derive(Default)]
struct SourceState {
    results: VecDeque<Result<Vec<Detection>, SourceError>>,
    fail_load: bool,
    latency: Duration,
    load_calls: usize,
    infer_calls: usize,
    active: usize,
    max_active: usize,
}

/// [`EmbeddingSource`] returning queued results, then empty detections.
/// Clones share state so a test can inspect a source it handed away.
#[derive(Clone, Default)]
pub struct ScriptedSource {
    state: Arc<Mutex<SourceState>>,
}

impl ScriptedSource {
    pub fn failing_load() -> Self {
        let source = Self::default();
        source.state.lock().fail_load = true;
        source
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.state.lock().latency = latency;
        self
    }

    pub fn push_result(&self, result: Result<Vec<Detection>, SourceError>) {
        self.state.lock().results.push_back(result);
    }

    pub fn load_calls(&self) -> usize {
        self.state.lock().load_calls
    }

    pub fn infer_calls(&self) -> usize {
        self.state.lock().infer_calls
    }

    /// Highest number of inference calls observed running at once.
    pub fn max_concurrent(&self) -> usize {
        self.state.lock().max_active
    }
}

#[async_trait]
impl EmbeddingSource for ScriptedSource {
    async fn load(&mut self) -> Result<(), SourceError> {
        let mut state = self.state.lock();
        state.load_calls += 1;
        if state.fail_load {
            Err(SourceError::ModelLoad("weights missing".into()))
        } else {
            Ok(())
        }
    }

    async fn infer(&mut self, _frame: &Frame) -> Result<Vec<Detection>, SourceError> {
        let (result, latency) = {
            let mut state = self.state.lock();
            state.infer_calls += 1;
            state.active += 1;
            state.max_active = state.max_active.max(state.active);
            (state.results.pop_front().unwrap_or_else(|| Ok(Vec::new())), state.latency)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.state.lock().active -= 1;
        result
    }
}

/// [`FrameSource`] yielding blank frames, or queued errors first.
#[derive(Clone, Default)]
pub struct ScriptedFrames {
    errors: Arc<Mutex<VecDeque<SourceError>>>,
    served: Arc<Mutex<usize>>,
}

impl ScriptedFrames {
    pub fn push_error(&self, err: SourceError) {
        self.errors.lock().push_back(err);
    }

    pub fn served(&self) -> usize {
        *self.served.lock()
    }
}

#[async_trait]
impl FrameSource for ScriptedFrames {
    async fn next_frame(&mut self) -> Result<Frame, SourceError> {
        *self.served.lock() += 1;
        if let Some(err) = self.errors.lock().pop_front() {
            return Err(err);
        }
        Ok(blank_frame())
    }
}

/// Store whose writes always fail.
pub struct FailingStore;

impl DurableStore for FailingStore {
    fn load_all(&self) -> Result<Vec<CacheEntry>, StoreError> {
        Ok(Vec::new())
    }

    fn upsert(&mut self, _entry: &CacheEntry) -> Result<(), StoreError> {
        Err(StoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full")))
    }
}
