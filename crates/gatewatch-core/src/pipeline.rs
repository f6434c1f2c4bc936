//! The detection loop and the context it owns.
//!
//! One task drives the pipeline tick by tick: take a frame, run the model,
//! filter for novel faces, log a snapshot per novel face and hand it to the
//! identity resolver. Detection is awaited inline, so a tick never starts
//! while the previous tick's detection is still running.

use crate::cache::{IdentityCache, DEFAULT_MATCH_THRESHOLD};
use crate::identity::IdentityService;
use crate::novelty::{NoveltyFilter, DEFAULT_HISTORY_CAPACITY, DEFAULT_NOVELTY_THRESHOLD};
use crate::resolver::{spawn_resolver, Admission, ResolveRequest, ResolverHandle, ResolverStats, DEFAULT_DEBOUNCE};
use crate::snapshot::{
    capture_snapshot, SnapshotLog, DEFAULT_JPEG_QUALITY, DEFAULT_SNAPSHOT_CAPACITY, DEFAULT_SNAPSHOT_PADDING,
};
use crate::source::{EmbeddingAdapter, EmbeddingSource, FrameSource, ModelState};
use crate::store::{DurableStore, StoreError};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("embedding model failed to load")]
    ModelLoad,
    #[error("identity cache: {0}")]
    Store(#[from] StoreError),
}

/// Tunables for the tracking pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub tick_interval: Duration,
    /// Distance under which a cached identity matches a face.
    pub match_threshold: f32,
    /// Distance under which a face counts as already tracked.
    pub novelty_threshold: f32,
    pub history_capacity: usize,
    pub snapshot_capacity: usize,
    pub debounce: Duration,
    pub snapshot_padding: f32,
    pub jpeg_quality: u8,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(1000),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            novelty_threshold: DEFAULT_NOVELTY_THRESHOLD,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            snapshot_capacity: DEFAULT_SNAPSHOT_CAPACITY,
            debounce: DEFAULT_DEBOUNCE,
            snapshot_padding: DEFAULT_SNAPSHOT_PADDING,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Loading,
    WaitingForFrame,
    Detecting,
    Idle,
    /// Model load failed; the loop will not run.
    Disabled,
    Stopped,
}

/// Running totals published by the loop.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub state: LoopState,
    pub ticks: u64,
    pub frames_skipped: u64,
    pub detection_failures: u64,
    pub faces_seen: u64,
    pub novel_faces: u64,
}

impl Default for PipelineStatus {
    fn default() -> Self {
        Self {
            state: LoopState::Loading,
            ticks: 0,
            frames_skipped: 0,
            detection_failures: 0,
            faces_seen: 0,
            novel_faces: 0,
        }
    }
}

/// Result of a single tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    NoFrame,
    DetectionFailed,
    Processed { faces: usize, novel: usize },
}

/// Pipeline state shared between the loop, the resolver and readers.
#[derive(Clone)]
pub struct PipelineContext {
    pub cache: Arc<Mutex<IdentityCache>>,
    pub log: Arc<Mutex<SnapshotLog>>,
    pub status: Arc<Mutex<PipelineStatus>>,
    pub resolver: ResolverHandle,
}

impl PipelineContext {
    pub fn resolver_stats(&self) -> ResolverStats {
        self.resolver.stats()
    }
}

/// Drives frames through the model, the novelty filter and the resolver.
pub struct DetectionLoop<F, S> {
    frames: F,
    model: EmbeddingAdapter<S>,
    novelty: NoveltyFilter,
    ctx: PipelineContext,
    config: PipelineConfig,
}

impl<F: FrameSource, S: EmbeddingSource> DetectionLoop<F, S> {
    pub fn new(frames: F, source: S, ctx: PipelineContext, config: PipelineConfig) -> Self {
        Self {
            frames,
            model: EmbeddingAdapter::new(source),
            novelty: NoveltyFilter::new(config.history_capacity, config.novelty_threshold),
            ctx,
            config,
        }
    }

    fn set_state(&self, state: LoopState) {
        self.ctx.status.lock().state = state;
    }

    /// Load the model, then tick until `shutdown` flips.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), PipelineError> {
        self.set_state(LoopState::Loading);
        let loaded = tokio::select! {
            biased;
            _ = shutdown.changed() => {
                self.set_state(LoopState::Stopped);
                return Ok(());
            }
            ok = self.model.load() => ok,
        };
        if !loaded {
            self.set_state(LoopState::Disabled);
            return Err(PipelineError::ModelLoad);
        }

        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.set_state(LoopState::Idle);
        tracing::info!(interval_ms = self.config.tick_interval.as_millis() as u64, "detection loop started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = self.tick() => {}
            }
        }

        self.set_state(LoopState::Stopped);
        tracing::info!("detection loop stopped");
        Ok(())
    }

    /// Run one `WaitingForFrame -> Detecting -> filter -> Idle` pass.
    pub async fn tick(&mut self) -> TickOutcome {
        self.ctx.status.lock().ticks += 1;
        self.set_state(LoopState::WaitingForFrame);

        let frame = match self.frames.next_frame().await {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(error = %e, "no frame this tick");
                let mut status = self.ctx.status.lock();
                status.frames_skipped += 1;
                status.state = LoopState::Idle;
                return TickOutcome::NoFrame;
            }
        };

        self.set_state(LoopState::Detecting);
        let started = std::time::Instant::now();
        let detections = match self.model.detect(&frame).await {
            Ok(detections) => detections,
            Err(e) => {
                tracing::warn!(error = %e, "detection failed; skipping tick");
                let mut status = self.ctx.status.lock();
                status.detection_failures += 1;
                status.state = LoopState::Idle;
                return TickOutcome::DetectionFailed;
            }
        };
        let faces = detections.len();
        tracing::debug!(
            faces,
            elapsed_ms = started.elapsed().as_millis() as u64,
            sequence = frame.sequence,
            "detection complete"
        );

        let mut novel = 0;
        for detection in detections {
            if !self.novelty.observe(&detection.embedding) {
                continue;
            }
            novel += 1;

            let snapshot = match capture_snapshot(
                &frame,
                &detection.bbox,
                self.config.snapshot_padding,
                self.config.jpeg_quality,
            ) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::warn!(error = %e, "snapshot capture failed");
                    continue;
                }
            };

            let request = ResolveRequest {
                snapshot_id: snapshot.id,
                embedding: detection.embedding,
                image: snapshot.image.clone(),
            };
            // Log first so an immediate cache hit has a snapshot to patch.
            self.ctx.log.lock().append(snapshot);

            match self.ctx.resolver.request(request) {
                Admission::Closed => tracing::warn!("resolver stopped; snapshot stays provisional"),
                admission => tracing::debug!(?admission, "novel face logged"),
            }
        }

        let mut status = self.ctx.status.lock();
        status.faces_seen += faces as u64;
        status.novel_faces += novel as u64;
        status.state = LoopState::Idle;

        TickOutcome::Processed { faces, novel }
    }

    pub fn model_state(&self) -> ModelState {
        self.model.state()
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }
}

/// Handles to a running pipeline.
pub struct Pipeline {
    pub context: PipelineContext,
    pub detection: JoinHandle<Result<(), PipelineError>>,
    pub resolver: JoinHandle<()>,
}

impl Pipeline {
    /// Open the identity cache, spawn the resolver and the detection loop.
    pub fn start<F, S>(
        frames: F,
        source: S,
        service: Arc<dyn IdentityService>,
        store: Box<dyn DurableStore>,
        config: PipelineConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, PipelineError>
    where
        F: FrameSource + 'static,
        S: EmbeddingSource + 'static,
    {
        let cache = Arc::new(Mutex::new(IdentityCache::open(store, config.match_threshold)?));
        let log = Arc::new(Mutex::new(SnapshotLog::new(config.snapshot_capacity)));
        let (resolver, resolver_join) =
            spawn_resolver(service, cache.clone(), log.clone(), config.debounce, shutdown.clone());

        let context = PipelineContext {
            cache,
            log,
            status: Arc::new(Mutex::new(PipelineStatus::default())),
            resolver,
        };
        let detection_loop = DetectionLoop::new(frames, source, context.clone(), config);
        let detection = tokio::spawn(detection_loop.run(shutdown));

        Ok(Self {
            context,
            detection,
            resolver: resolver_join,
        })
    }
}
