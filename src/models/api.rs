use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::scan::ScanStatus;

/// Response after submitting an image for scanning.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub scan_id: Uuid,
    pub status: ScanStatus,
    pub message: String,
}
