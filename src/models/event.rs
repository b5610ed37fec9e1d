use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::scan::ScanStatus;

/// What happened to the active scan.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Submitted,
    Progressed,
    Completed,
    Failed,
    /// The scan left the coordinator's slot (abandoned, replaced or torn down).
    Released,
}

/// Read-only view of the active scan, for rendering.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanSnapshot {
    pub scan_id: Uuid,
    pub status: ScanStatus,
    pub text_result: Option<String>,
    pub classification_result: Option<String>,
    pub face_result: Option<String>,
    /// Present results joined by a blank line.
    pub summary: String,
}

/// Emitted by the coordinator on every transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LifecycleEvent {
    pub scan_id: Uuid,
    pub kind: EventKind,
    pub status: ScanStatus,
    pub text_result: Option<String>,
    pub classification_result: Option<String>,
    pub face_result: Option<String>,
    pub emitted_at: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn new(kind: EventKind, snapshot: &ScanSnapshot) -> Self {
        Self {
            scan_id: snapshot.scan_id,
            kind,
            status: snapshot.status,
            text_result: snapshot.text_result.clone(),
            classification_result: snapshot.classification_result.clone(),
            face_result: snapshot.face_result.clone(),
            emitted_at: Utc::now(),
        }
    }
}
