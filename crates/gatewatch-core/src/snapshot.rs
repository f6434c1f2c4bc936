//! Bounded log of recent face captures with asynchronous label back-fill.

use crate::types::{BoundingBox, Frame};
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use serde::{Serialize, Serializer};
use std::collections::VecDeque;
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_SNAPSHOT_CAPACITY: usize = 20;
/// Padding around the face box, as a fraction of the box's shorter side.
pub const DEFAULT_SNAPSHOT_PADDING: f32 = 0.2;
pub const DEFAULT_JPEG_QUALITY: u8 = 92;

const LABEL_PROCESSING: &str = "Processing...";
const LABEL_UNRECOGNIZED: &str = "Unrecognized";

/// Identity label attached to a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotLabel {
    Processing,
    Unrecognized,
    Resolved(String),
}

impl SnapshotLabel {
    /// Parse a stored label string back into a variant.
    pub fn from_stored(label: &str) -> Self {
        match label {
            LABEL_PROCESSING => Self::Processing,
            LABEL_UNRECOGNIZED => Self::Unrecognized,
            other => Self::Resolved(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Processing => LABEL_PROCESSING,
            Self::Unrecognized => LABEL_UNRECOGNIZED,
            Self::Resolved(name) => name,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Processing)
    }
}

impl std::fmt::Display for SnapshotLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for SnapshotLabel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// A captured face crop.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub id: Uuid,
    /// JPEG-encoded crop.
    #[serde(skip)]
    pub image: Vec<u8>,
    pub captured_at: DateTime<Utc>,
    /// Crop region in frame coordinates (face box plus padding).
    pub bbox: BoundingBox,
    pub label: SnapshotLabel,
}

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("frame has invalid dimensions")]
    InvalidFrame,
    #[error("face box lies outside the frame")]
    EmptyCrop,
    #[error("jpeg encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// Crop `face` (padded) out of `frame` and encode it as JPEG.
pub fn capture_snapshot(
    frame: &Frame,
    face: &BoundingBox,
    padding: f32,
    quality: u8,
) -> Result<Snapshot, SnapshotError> {
    let img = frame.to_image().ok_or(SnapshotError::InvalidFrame)?;

    let pad = face.width.min(face.height).max(0.0) * padding;
    let x0 = (face.x - pad).max(0.0);
    let y0 = (face.y - pad).max(0.0);
    let x1 = (face.x + face.width + pad).min(frame.width as f32);
    let y1 = (face.y + face.height + pad).min(frame.height as f32);

    if x1 - x0 < 1.0 || y1 - y0 < 1.0 {
        return Err(SnapshotError::EmptyCrop);
    }

    let (cx, cy) = (x0.floor() as u32, y0.floor() as u32);
    let cw = ((x1 - x0).round() as u32).clamp(1, frame.width - cx);
    let ch = ((y1 - y0).round() as u32).clamp(1, frame.height - cy);

    let crop = image::imageops::crop_imm(&img, cx, cy, cw, ch).to_image();
    let mut image = Vec::new();
    JpegEncoder::new_with_quality(&mut image, quality).encode_image(&crop)?;

    Ok(Snapshot {
        id: Uuid::new_v4(),
        image,
        captured_at: frame.captured_at,
        bbox: BoundingBox {
            x: cx as f32,
            y: cy as f32,
            width: cw as f32,
            height: ch as f32,
            confidence: face.confidence,
        },
        label: SnapshotLabel::Processing,
    })
}

/// Encode a whole frame as JPEG.
pub fn encode_frame(frame: &Frame, quality: u8) -> Result<Vec<u8>, SnapshotError> {
    let img = frame.to_image().ok_or(SnapshotError::InvalidFrame)?;
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality).encode_image(&img)?;
    Ok(out)
}

/// Insertion-ordered ring of snapshots with FIFO eviction.
///
/// Eviction ignores whether a snapshot's label is still pending.
#[derive(Debug)]
pub struct SnapshotLog {
    entries: VecDeque<Snapshot>,
    capacity: usize,
}

impl SnapshotLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    /// Push to the tail. Returns the evicted head when over capacity.
    pub fn append(&mut self, snapshot: Snapshot) -> Option<Snapshot> {
        self.entries.push_back(snapshot);
        if self.entries.len() > self.capacity {
            self.entries.pop_front()
        } else {
            None
        }
    }

    /// Set the label of the snapshot with `id`. Returns `false` if it has
    /// already been evicted.
    pub fn patch_label(&mut self, id: Uuid, label: SnapshotLabel) -> bool {
        match self.entries.iter_mut().find(|s| s.id == id) {
            Some(snapshot) => {
                snapshot.label = label;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: Uuid) -> Option<&Snapshot> {
        self.entries.iter().find(|s| s.id == id)
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Snapshot> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn pending(&self) -> usize {
        self.entries.iter().filter(|s| s.label.is_pending()).count()
    }
}

impl Default for SnapshotLog {
    fn default() -> Self {
        Self::new(DEFAULT_SNAPSHOT_CAPACITY)
    }
}
