//! One-shot check-in and check-out.
//!
//! The desk submits a single full frame per user action. There is no retry;
//! whatever the service says back, success or refusal, is handed to the caller.

use crate::identity::{encode_image, IdentityService, ServiceError, Visitor};
use crate::snapshot::{encode_frame, SnapshotError};
use crate::types::Frame;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AttendanceError {
    #[error("a submission is already in progress")]
    Busy,
    #[error("could not encode frame: {0}")]
    Frame(#[from] SnapshotError),
    /// Refusal from the service, worded by the service.
    #[error("{0}")]
    Rejected(String),
    #[error("attendance service: {0}")]
    Service(ServiceError),
}

impl From<ServiceError> for AttendanceError {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::Rejected(msg) => AttendanceError::Rejected(msg),
            other => AttendanceError::Service(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceKind {
    CheckIn,
    CheckOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeskState {
    Idle,
    Submitting,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttendanceOutcome {
    pub kind: AttendanceKind,
    pub visitor: Visitor,
    pub message: String,
}

impl AttendanceOutcome {
    fn new(kind: AttendanceKind, visitor: Visitor) -> Self {
        let message = match kind {
            AttendanceKind::CheckIn => format!("Check-In Successful, Hello {}", visitor.full_name),
            AttendanceKind::CheckOut => {
                format!("Check-Out Successful, See you next time {} !", visitor.full_name)
            }
        };
        Self { kind, visitor, message }
    }
}

/// Clears the submitting flag however the submission ends.
struct SubmitGuard<'a>(&'a AtomicBool);

impl Drop for SubmitGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct AttendanceDesk {
    service: Arc<dyn IdentityService>,
    submitting: Arc<AtomicBool>,
    quality: u8,
}

impl AttendanceDesk {
    pub fn new(service: Arc<dyn IdentityService>, quality: u8) -> Self {
        Self {
            service,
            submitting: Arc::new(AtomicBool::new(false)),
            quality,
        }
    }

    pub fn state(&self) -> DeskState {
        if self.submitting.load(Ordering::Acquire) {
            DeskState::Submitting
        } else {
            DeskState::Idle
        }
    }

    /// Submit `frame` for check-in or check-out. Refused while another
    /// submission is outstanding.
    pub async fn submit(&self, kind: AttendanceKind, frame: &Frame) -> Result<AttendanceOutcome, AttendanceError> {
        if self
            .submitting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(AttendanceError::Busy);
        }
        let _guard = SubmitGuard(&self.submitting);

        let image = encode_image(&encode_frame(frame, self.quality)?);
        let result = match kind {
            AttendanceKind::CheckIn => self.service.check_in(&image).await,
            AttendanceKind::CheckOut => self.service.check_out(&image).await,
        };

        match result {
            Ok(visitor) => {
                tracing::info!(?kind, visitor = %visitor.full_name, "attendance recorded");
                Ok(AttendanceOutcome::new(kind, visitor))
            }
            Err(e) => {
                tracing::warn!(?kind, error = %e, "attendance submission failed");
                Err(e.into())
            }
        }
    }
}
