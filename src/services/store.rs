//! Contract for the shared record store the coordinator synchronizes against.
//!
//! The store is treated as an opaque, eventually consistent key-value store.
//! Subscriptions push every committed revision of a watched record into a
//! channel: per-id ordered, at-least-once, no ordering across ids.

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::models::scan::{ScanPatch, ScanRecord, ScanRevision};

/// Where a subscription delivers revisions.
pub type RevisionSink = mpsc::UnboundedSender<ScanRevision>;

/// Opaque token returned by `subscribe`, consumed by `unsubscribe`.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    scan_id: Uuid,
    key: u64,
}

impl SubscriptionHandle {
    pub fn new(scan_id: Uuid, key: u64) -> Self {
        Self { scan_id, key }
    }

    pub fn scan_id(&self) -> Uuid {
        self.scan_id
    }

    pub fn key(&self) -> u64 {
        self.key
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Persist a new record, returning its key.
    async fn create(&self, record: &ScanRecord) -> Result<Uuid, StoreError>;

    /// Overwrite the fields carried by `patch` and notify subscribers.
    async fn update(&self, id: Uuid, patch: &ScanPatch) -> Result<(), StoreError>;

    async fn delete(&self, id: Uuid) -> Result<(), StoreError>;

    /// Start delivering revisions of `id` into `sink`.
    async fn subscribe(&self, id: Uuid, sink: RevisionSink)
        -> Result<SubscriptionHandle, StoreError>;

    /// Stop a subscription. Unknown handles are ignored.
    async fn unsubscribe(&self, handle: SubscriptionHandle);

    /// Check connectivity (for health checks).
    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Record store unavailable: {0}")]
    Unavailable(String),

    #[error("Scan record {0} not found")]
    NotFound(Uuid),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Record store error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout()
        {
            StoreError::Unavailable(e.to_string())
        } else {
            StoreError::Backend(e.to_string())
        }
    }
}
