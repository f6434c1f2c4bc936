use crate::engine::EngineHandle;
use gatewatch_core::attendance::{AttendanceDesk, AttendanceKind, DeskState};
use gatewatch_core::identity::encode_image;
use gatewatch_core::pipeline::PipelineContext;
use gatewatch_core::snapshot::Snapshot;
use serde_json::{json, Value};
use zbus::interface;

pub const BUS_NAME: &str = "org.gatewatch.Gatewatch1";
pub const OBJECT_PATH: &str = "/org/gatewatch/Gatewatch1";

/// D-Bus interface for the gatewatch daemon.
///
/// Bus name: org.gatewatch.Gatewatch1
/// Object path: /org/gatewatch/Gatewatch1
pub struct GatewatchService {
    pipeline: PipelineContext,
    desk: AttendanceDesk,
    engine: EngineHandle,
}

impl GatewatchService {
    pub fn new(pipeline: PipelineContext, desk: AttendanceDesk, engine: EngineHandle) -> Self {
        Self { pipeline, desk, engine }
    }

    async fn attendance(&self, kind: AttendanceKind) -> zbus::fdo::Result<String> {
        tracing::info!(?kind, "attendance requested");
        let frame = self
            .engine
            .capture()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("capture: {e}")))?;
        let outcome = self
            .desk
            .submit(kind, &frame)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        serde_json::to_string(&outcome).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }
}

fn snapshot_json(snapshot: &Snapshot, include_image: bool) -> Value {
    let mut value = json!({
        "id": snapshot.id,
        "captured_at": snapshot.captured_at,
        "bbox": snapshot.bbox,
        "label": snapshot.label,
    });
    if include_image {
        value["image"] = Value::String(encode_image(&snapshot.image));
    }
    value
}

#[interface(name = "org.gatewatch.Gatewatch1")]
impl GatewatchService {
    /// Pipeline, cache and resolver state as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.pipeline.status.lock().clone();
        let (snapshots, pending) = {
            let log = self.pipeline.log.lock();
            (log.len(), log.pending())
        };
        let (durable, session) = {
            let cache = self.pipeline.cache.lock();
            (cache.durable_len(), cache.session_len())
        };
        Ok(json!({
            "version": env!("CARGO_PKG_VERSION"),
            "models_loaded": self.engine.models_loaded(),
            "pipeline": status,
            "snapshots": { "count": snapshots, "pending": pending },
            "cache": { "durable": durable, "session": session },
            "resolver": {
                "in_flight": self.pipeline.resolver.is_in_flight(),
                "stats": self.pipeline.resolver_stats(),
            },
            "attendance_busy": self.desk.state() == DeskState::Submitting,
        })
        .to_string())
    }

    /// Snapshot log, oldest first, as a JSON array.
    async fn snapshots(&self, include_images: bool) -> zbus::fdo::Result<String> {
        let entries: Vec<Value> = self
            .pipeline
            .log
            .lock()
            .iter()
            .map(|s| snapshot_json(s, include_images))
            .collect();
        Ok(Value::Array(entries).to_string())
    }

    /// Capture a frame and check the visitor in.
    async fn check_in(&self) -> zbus::fdo::Result<String> {
        self.attendance(AttendanceKind::CheckIn).await
    }

    /// Capture a frame and check the visitor out.
    async fn check_out(&self) -> zbus::fdo::Result<String> {
        self.attendance(AttendanceKind::CheckOut).await
    }
}
