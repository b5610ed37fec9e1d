use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Lifecycle stage of a scan record as stored remotely.
///
/// Analyzers that still report per-analyzer progress literals
/// (`TextScanResultReady` and friends) are folded into `Processing`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq, Hash)]
pub enum ScanStatus {
    Uploading,
    #[serde(
        alias = "TextScanResultReady",
        alias = "ClassificationResultReady",
        alias = "FaceDetectionResultReady"
    )]
    #[strum(
        to_string = "Processing",
        serialize = "TextScanResultReady",
        serialize = "ClassificationResultReady",
        serialize = "FaceDetectionResultReady"
    )]
    Processing,
    Completed,
    Failed,
}

impl ScanStatus {
    /// `Completed` and `Failed` admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, ScanStatus::Completed | ScanStatus::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            ScanStatus::Uploading => 0,
            ScanStatus::Processing => 1,
            ScanStatus::Completed | ScanStatus::Failed => 2,
        }
    }

    /// Whether moving from `self` to `next` goes forward in the lifecycle.
    pub fn precedes(self, next: ScanStatus) -> bool {
        self.rank() < next.rank()
    }
}

/// One scan attempt, keyed by `id` in the record store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanRecord {
    pub id: Uuid,
    pub status: ScanStatus,
    #[serde(skip)]
    pub image_data: Vec<u8>,
    pub text_result: Option<String>,
    pub classification_result: Option<String>,
    pub face_result: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ScanRecord {
    /// A fresh record for an already preprocessed image.
    pub fn new(image_data: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: ScanStatus::Uploading,
            image_data,
            text_result: None,
            classification_result: None,
            face_result: None,
            created_at: Utc::now(),
        }
    }

    /// The record as subscribers see it (image bytes are never re-delivered).
    pub fn revision(&self) -> ScanRevision {
        ScanRevision {
            id: self.id,
            status: self.status,
            text_result: self.text_result.clone(),
            classification_result: self.classification_result.clone(),
            face_result: self.face_result.clone(),
        }
    }
}

/// Partial field update sent with `RecordStore::update`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScanPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ScanStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification_result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub face_result: Option<String>,
}

impl ScanPatch {
    pub fn status(status: ScanStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn text(result: impl Into<String>) -> Self {
        Self {
            text_result: Some(result.into()),
            ..Self::default()
        }
    }

    pub fn classification(result: impl Into<String>) -> Self {
        Self {
            classification_result: Some(result.into()),
            ..Self::default()
        }
    }

    pub fn face(result: impl Into<String>) -> Self {
        Self {
            face_result: Some(result.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Overwrite the fields this patch carries.
    pub fn apply_to(&self, record: &mut ScanRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(text) = &self.text_result {
            record.text_result = Some(text.clone());
        }
        if let Some(class) = &self.classification_result {
            record.classification_result = Some(class.clone());
        }
        if let Some(face) = &self.face_result {
            record.face_result = Some(face.clone());
        }
    }
}

/// One delivered version of a record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanRevision {
    pub id: Uuid,
    pub status: ScanStatus,
    #[serde(default)]
    pub text_result: Option<String>,
    #[serde(default)]
    pub classification_result: Option<String>,
    #[serde(default)]
    pub face_result: Option<String>,
}
