//! gatewatch-core: face tracking and identity resolution.
//!
//! Frames flow through an embedding model and a novelty filter; each new face
//! is cropped into the snapshot log and resolved against a two-tier identity
//! cache before a remote visitor service is consulted.

pub mod attendance;
pub mod cache;
pub mod detector;
pub mod identity;
pub mod model;
pub mod novelty;
pub mod pipeline;
pub mod recognizer;
pub mod resolver;
pub mod snapshot;
pub mod source;
pub mod store;
pub mod types;

#[cfg(test)]
mod testing;

pub use attendance::{AttendanceDesk, AttendanceError, AttendanceKind, AttendanceOutcome};
pub use cache::IdentityCache;
pub use identity::{HttpIdentityService, IdentityService, ServiceError, Visitor};
pub use model::FaceModel;
pub use pipeline::{Pipeline, PipelineConfig, PipelineContext, PipelineError, PipelineStatus};
pub use snapshot::{Snapshot, SnapshotLabel, SnapshotLog};
pub use source::{EmbeddingSource, FrameSource, SourceError};
pub use store::{DurableStore, SqliteStore};
pub use types::{BoundingBox, Detection, Embedding, Frame};
