use uuid::Uuid;

use crate::models::event::ScanSnapshot;
use crate::models::scan::{ScanRevision, ScanStatus};

/// Outcome of folding one revision into the mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Nothing observable changed (duplicate, stale or post-terminal revision).
    Unchanged,
    Progressed,
    Completed,
    Failed,
}

/// Local copy of the active scan's result fields.
///
/// Only ever written by the coordinator. Result fields are first-write-wins
/// and never cleared, and the status is derived from what is present, so
/// merging is idempotent and insensitive to replays.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanMirror {
    id: Uuid,
    status: ScanStatus,
    text_result: Option<String>,
    classification_result: Option<String>,
    face_result: Option<String>,
}

fn fill(slot: &mut Option<String>, incoming: &Option<String>) -> bool {
    match (slot.is_none(), incoming) {
        (true, Some(value)) => {
            *slot = Some(value.clone());
            true
        }
        _ => false,
    }
}

impl ScanMirror {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            status: ScanStatus::Uploading,
            text_result: None,
            classification_result: None,
            face_result: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn status(&self) -> ScanStatus {
        self.status
    }

    pub fn is_complete(&self) -> bool {
        self.text_result.is_some() && self.classification_result.is_some() && self.face_result.is_some()
    }

    /// Fold a delivered revision into the mirror.
    ///
    /// The caller is responsible for only passing revisions of this scan.
    pub fn merge(&mut self, revision: &ScanRevision) -> Transition {
        if self.status.is_terminal() {
            return Transition::Unchanged;
        }

        let mut changed = fill(&mut self.text_result, &revision.text_result);
        changed |= fill(&mut self.classification_result, &revision.classification_result);
        changed |= fill(&mut self.face_result, &revision.face_result);

        let next = self.derive_status(revision.status == ScanStatus::Failed, revision.status);
        if self.status.precedes(next) {
            self.status = next;
            changed = true;
        }

        match (changed, self.status) {
            (false, _) => Transition::Unchanged,
            (true, ScanStatus::Completed) => Transition::Completed,
            (true, ScanStatus::Failed) => Transition::Failed,
            (true, _) => Transition::Progressed,
        }
    }

    /// Status as a function of the result fields and the failure signal.
    ///
    /// A remote `Completed` without all three results is not trusted.
    fn derive_status(&self, failed: bool, remote: ScanStatus) -> ScanStatus {
        if failed {
            ScanStatus::Failed
        } else if self.is_complete() {
            ScanStatus::Completed
        } else if remote != ScanStatus::Uploading
            || self.text_result.is_some()
            || self.classification_result.is_some()
            || self.face_result.is_some()
        {
            ScanStatus::Processing
        } else {
            ScanStatus::Uploading
        }
    }

    /// Present results in text, classification, face order, blank-line separated.
    pub fn aggregated_text(&self) -> String {
        [&self.text_result, &self.classification_result, &self.face_result]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn snapshot(&self) -> ScanSnapshot {
        ScanSnapshot {
            scan_id: self.id,
            status: self.status,
            text_result: self.text_result.clone(),
            classification_result: self.classification_result.clone(),
            face_result: self.face_result.clone(),
            summary: self.aggregated_text(),
        }
    }
}
