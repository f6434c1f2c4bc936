//! Debounced, single-flight, cache-first identity resolution.
//!
//! Requests are admitted synchronously by [`ResolverHandle::request`]:
//! a cache hit is applied on the spot, a request arriving while a remote
//! call is outstanding is ignored, and everything else is handed to the
//! resolver task. The task keeps only the latest pending request and fires
//! it once no newer request has arrived for the debounce window.

use crate::cache::IdentityCache;
use crate::identity::{encode_image, IdentityService, ServiceError};
use crate::snapshot::{SnapshotLabel, SnapshotLog};
use crate::types::Embedding;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

/// A novel face waiting for a label.
#[derive(Debug, Clone)]
pub struct ResolveRequest {
    pub snapshot_id: Uuid,
    pub embedding: Embedding,
    /// JPEG bytes sent to the identification service.
    pub image: Vec<u8>,
}

/// What happened to a request at admission time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Answered from cache; the snapshot was patched immediately.
    CacheHit(String),
    /// Handed to the resolver task for debounced dispatch.
    Queued,
    /// A remote call is outstanding; the request was dropped.
    Busy,
    /// The resolver task has stopped.
    Closed,
}

/// Broadcast to subscribers whenever a snapshot receives its label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelUpdate {
    pub snapshot_id: Uuid,
    pub label: SnapshotLabel,
    pub from_cache: bool,
}

/// Counters describing resolver activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ResolverStats {
    pub cache_hits: u64,
    pub remote_calls: u64,
    pub remote_failures: u64,
    pub debounced: u64,
    pub busy: u64,
}

#[derive(Default)]
struct Counters {
    cache_hits: AtomicU64,
    remote_calls: AtomicU64,
    remote_failures: AtomicU64,
    debounced: AtomicU64,
    busy: AtomicU64,
}

struct Shared {
    cache: Arc<Mutex<IdentityCache>>,
    log: Arc<Mutex<SnapshotLog>>,
    in_flight: AtomicBool,
    counters: Counters,
    updates: broadcast::Sender<LabelUpdate>,
}

impl Shared {
    /// Patch the snapshot (if still logged) and notify subscribers.
    fn apply(&self, snapshot_id: Uuid, label: SnapshotLabel, from_cache: bool) {
        let patched = self.log.lock().patch_label(snapshot_id, label.clone());
        if !patched {
            tracing::debug!(%snapshot_id, %label, "snapshot evicted before label arrived");
        }
        // No subscribers is fine.
        let _ = self.updates.send(LabelUpdate {
            snapshot_id,
            label,
            from_cache,
        });
    }

    fn cached_label(&self, embedding: &Embedding) -> Option<SnapshotLabel> {
        let hit = self.cache.lock().lookup(embedding)?;
        tracing::debug!(label = %hit.label, tier = ?hit.tier, distance = hit.distance, "identity cache hit");
        Some(SnapshotLabel::from_stored(&hit.label))
    }
}

/// Clone-safe handle to the resolver task.
#[derive(Clone)]
pub struct ResolverHandle {
    tx: mpsc::UnboundedSender<ResolveRequest>,
    shared: Arc<Shared>,
}

impl ResolverHandle {
    /// Admit a resolution request. Never blocks and never calls the service.
    pub fn request(&self, req: ResolveRequest) -> Admission {
        if let Some(label) = self.shared.cached_label(&req.embedding) {
            self.shared.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            let text = label.as_str().to_string();
            self.shared.apply(req.snapshot_id, label, true);
            return Admission::CacheHit(text);
        }

        if self.shared.in_flight.load(Ordering::SeqCst) {
            self.shared.counters.busy.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(snapshot_id = %req.snapshot_id, "identification in flight; request ignored");
            return Admission::Busy;
        }

        match self.tx.send(req) {
            Ok(()) => Admission::Queued,
            Err(_) => Admission::Closed,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LabelUpdate> {
        self.shared.updates.subscribe()
    }

    pub fn stats(&self) -> ResolverStats {
        let c = &self.shared.counters;
        ResolverStats {
            cache_hits: c.cache_hits.load(Ordering::Relaxed),
            remote_calls: c.remote_calls.load(Ordering::Relaxed),
            remote_failures: c.remote_failures.load(Ordering::Relaxed),
            debounced: c.debounced.load(Ordering::Relaxed),
            busy: c.busy.load(Ordering::Relaxed),
        }
    }
}

/// Spawn the resolver task.
///
/// The task stops when `shutdown` flips (or its sender is dropped) or when
/// every [`ResolverHandle`] is gone. An outstanding remote call is abandoned
/// on shutdown.
pub fn spawn_resolver(
    service: Arc<dyn IdentityService>,
    cache: Arc<Mutex<IdentityCache>>,
    log: Arc<Mutex<SnapshotLog>>,
    debounce: Duration,
    shutdown: watch::Receiver<bool>,
) -> (ResolverHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (updates, _) = broadcast::channel(64);
    let shared = Arc::new(Shared {
        cache,
        log,
        in_flight: AtomicBool::new(false),
        counters: Counters::default(),
        updates,
    });

    let worker = Worker {
        service,
        shared: shared.clone(),
        debounce,
    };
    let join = tokio::spawn(worker.run(rx, shutdown));

    (ResolverHandle { tx, shared }, join)
}

struct Worker {
    service: Arc<dyn IdentityService>,
    shared: Arc<Shared>,
    debounce: Duration,
}

impl Worker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<ResolveRequest>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(debounce_ms = self.debounce.as_millis() as u64, "resolver started");
        let mut pending: Option<ResolveRequest> = None;
        let mut deadline = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                msg = rx.recv() => match msg {
                    Some(req) => {
                        if let Some(dropped) = pending.replace(req) {
                            self.shared.counters.debounced.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!(snapshot_id = %dropped.snapshot_id, "superseded within debounce window");
                        }
                        deadline = Instant::now() + self.debounce;
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline), if pending.is_some() => {
                    if let Some(req) = pending.take() {
                        if !self.dispatch(req, &mut shutdown).await {
                            break;
                        }
                    }
                }
            }
        }

        tracing::info!("resolver stopped");
    }

    /// Resolve one request. Returns `false` if shutdown interrupted the call.
    async fn dispatch(&self, req: ResolveRequest, shutdown: &mut watch::Receiver<bool>) -> bool {
        // Another request may have populated the cache while this one waited.
        if let Some(label) = self.shared.cached_label(&req.embedding) {
            self.shared.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            self.shared.apply(req.snapshot_id, label, true);
            return true;
        }

        self.shared.in_flight.store(true, Ordering::SeqCst);
        self.shared.counters.remote_calls.fetch_add(1, Ordering::Relaxed);
        let image = encode_image(&req.image);

        let outcome = tokio::select! {
            res = self.service.identify(&image) => res,
            _ = shutdown.changed() => Err(ServiceError::Cancelled),
        };

        let completed = !matches!(outcome, Err(ServiceError::Cancelled));
        match outcome {
            Ok(visitor) => {
                let label = match visitor {
                    Some(v) if !v.full_name.trim().is_empty() => SnapshotLabel::Resolved(v.full_name),
                    _ => SnapshotLabel::Unrecognized,
                };
                tracing::info!(snapshot_id = %req.snapshot_id, %label, "identity resolved");
                self.shared.cache.lock().insert(req.embedding, label.as_str());
                self.shared.apply(req.snapshot_id, label, false);
            }
            Err(ServiceError::Cancelled) => {
                tracing::debug!(snapshot_id = %req.snapshot_id, "identification abandoned at shutdown");
            }
            Err(e) => {
                self.shared.counters.remote_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(snapshot_id = %req.snapshot_id, error = %e, "identification failed; label left provisional");
            }
        }

        self.shared.in_flight.store(false, Ordering::SeqCst);
        completed
    }
}
