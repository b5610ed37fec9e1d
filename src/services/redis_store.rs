use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::models::scan::{ScanPatch, ScanRecord, ScanRevision, ScanStatus};
use crate::services::store::{RecordStore, RevisionSink, StoreError, SubscriptionHandle};

const KEY_PREFIX: &str = "scan";
const RESULT_FIELDS: [&str; 4] = [
    "status",
    "text_result",
    "classification_result",
    "face_result",
];

fn record_key(id: Uuid) -> String {
    format!("{KEY_PREFIX}:{id}")
}

fn revision_channel(id: Uuid) -> String {
    format!("{KEY_PREFIX}:{id}:revisions")
}

/// Write patch fields only if the record still exists, then read its
/// revision fields back. Returns nil for a missing record, so a write racing
/// a delete never recreates the hash.
fn update_script() -> redis::Script {
    redis::Script::new(
        r#"
        if redis.call('EXISTS', KEYS[1]) == 0 then
            return nil
        end
        if #ARGV > 0 then
            redis.call('HSET', KEYS[1], unpack(ARGV))
        end
        return redis.call('HMGET', KEYS[1], 'status', 'text_result', 'classification_result', 'face_result')
        "#,
    )
}

type RevisionFields = (
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
);

/// Redis-backed record store.
///
/// Each record is a hash at `scan:{id}`. Every update publishes the
/// record's revision as JSON on `scan:{id}:revisions`; each subscription
/// holds its own pub/sub connection, pumped by a background task.
pub struct RedisRecordStore {
    client: redis::Client,
    update_script: redis::Script,
    subscriptions: Mutex<HashMap<u64, JoinHandle<()>>>,
    next_key: AtomicU64,
}

impl RedisRecordStore {
    pub fn new(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            update_script: update_script(),
            subscriptions: Mutex::new(HashMap::new()),
            next_key: AtomicU64::new(1),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, StoreError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    /// Read the revision fields of a record; `None` if it does not exist.
    async fn read_revision(
        conn: &mut redis::aio::MultiplexedConnection,
        id: Uuid,
    ) -> Result<Option<ScanRevision>, StoreError> {
        let fields: RevisionFields = redis::cmd("HMGET")
            .arg(record_key(id))
            .arg(&RESULT_FIELDS[..])
            .query_async(conn)
            .await?;
        revision_from_fields(id, fields)
    }
}

fn revision_from_fields(id: Uuid, fields: RevisionFields) -> Result<Option<ScanRevision>, StoreError> {
    let (status, text_result, classification_result, face_result) = fields;
    let Some(status) = status else {
        return Ok(None);
    };
    let status = ScanStatus::from_str(&status)
        .map_err(|_| StoreError::Backend(format!("unknown scan status {status:?}")))?;
    Ok(Some(ScanRevision {
        id,
        status,
        text_result,
        classification_result,
        face_result,
    }))
}

fn patch_fields(patch: &ScanPatch) -> Vec<(&'static str, String)> {
    let mut fields = Vec::new();
    if let Some(status) = patch.status {
        fields.push(("status", status.to_string()));
    }
    if let Some(text) = &patch.text_result {
        fields.push(("text_result", text.clone()));
    }
    if let Some(class) = &patch.classification_result {
        fields.push(("classification_result", class.clone()));
    }
    if let Some(face) = &patch.face_result {
        fields.push(("face_result", face.clone()));
    }
    fields
}

#[async_trait]
impl RecordStore for RedisRecordStore {
    async fn create(&self, record: &ScanRecord) -> Result<Uuid, StoreError> {
        let mut conn = self.connection().await?;
        let key = record_key(record.id);

        redis::pipe()
            .atomic()
            .hset(&key, "status", record.status.to_string())
            .ignore()
            .hset(&key, "image_data", record.image_data.as_slice())
            .ignore()
            .hset(&key, "created_at", record.created_at.to_rfc3339())
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        tracing::debug!(scan_id = %record.id, bytes = record.image_data.len(), "Scan record created");
        Ok(record.id)
    }

    async fn update(&self, id: Uuid, patch: &ScanPatch) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let key = record_key(id);

        let mut invocation = self.update_script.prepare_invoke();
        invocation.key(&key);
        for (field, value) in patch_fields(patch) {
            invocation.arg(field).arg(value);
        }
        let fields: Option<RevisionFields> = invocation.invoke_async(&mut conn).await?;

        let Some(revision) = fields
            .map(|fields| revision_from_fields(id, fields))
            .transpose()?
            .flatten()
        else {
            return Err(StoreError::NotFound(id));
        };
        let payload = serde_json::to_string(&revision)?;
        conn.publish::<_, _, ()>(revision_channel(id), payload).await?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let removed: u64 = conn.del(record_key(id)).await?;
        if removed == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        id: Uuid,
        sink: RevisionSink,
    ) -> Result<SubscriptionHandle, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(revision_channel(id)).await?;

        // Anything written between create and subscribe
        let mut conn = self.connection().await?;
        let current = Self::read_revision(&mut conn, id)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        let _ = sink.send(current);

        let task = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(scan_id = %id, error = %e, "Unreadable revision payload");
                        continue;
                    }
                };
                match serde_json::from_str::<ScanRevision>(&payload) {
                    Ok(revision) => {
                        if sink.send(revision).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(scan_id = %id, error = %e, "Malformed revision payload");
                    }
                }
            }
            tracing::debug!(scan_id = %id, "Revision stream closed");
        });

        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key, task);
        Ok(SubscriptionHandle::new(id, key))
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        let task = self
            .subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&handle.key());
        // Aborting drops the pub/sub connection, which ends the subscription
        if let Some(task) = task {
            task.abort();
        }
    }

    /// Check Redis connectivity (for health checks).
    async fn health_check(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

impl Drop for RedisRecordStore {
    fn drop(&mut self) {
        let subscriptions = self
            .subscriptions
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (_, task) in subscriptions.drain() {
            task.abort();
        }
    }
}
