use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::scan::{ScanPatch, ScanRecord, ScanRevision};
use crate::services::store::{RecordStore, RevisionSink, StoreError, SubscriptionHandle};

/// A store operation that reached the in-memory backend.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreCall {
    Create(Uuid),
    Update(Uuid, ScanPatch),
    Delete(Uuid),
    Subscribe(Uuid),
    Unsubscribe(Uuid),
}

/// In-process record store.
///
/// Revisions are fanned out synchronously inside `update`, so per-id order
/// is commit order. Used as the `memory` backend and as the test double for
/// the coordinator: it can be switched offline, and a store built with
/// [`MemoryRecordStore::recording`] keeps a log of calls.
#[derive(Debug)]
pub struct MemoryRecordStore {
    inner: Mutex<Inner>,
    next_key: AtomicU64,
}

#[derive(Debug)]
struct Inner {
    available: bool,
    records: HashMap<Uuid, ScanRecord>,
    subscribers: HashMap<u64, (Uuid, RevisionSink)>,
    /// Only kept by recording stores
    calls: Option<Vec<StoreCall>>,
}

impl Inner {
    fn log(&mut self, call: StoreCall) {
        if let Some(calls) = self.calls.as_mut() {
            calls.push(call);
        }
    }
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::with_log(None)
    }

    /// A store that logs every successful call, for inspection with
    /// [`MemoryRecordStore::calls`].
    pub fn recording() -> Self {
        Self::with_log(Some(Vec::new()))
    }

    fn with_log(calls: Option<Vec<StoreCall>>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                available: true,
                records: HashMap::new(),
                subscribers: HashMap::new(),
                calls,
            }),
            next_key: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Simulate losing (or regaining) the connection.
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    pub fn record(&self, id: Uuid) -> Option<ScanRecord> {
        self.lock().records.get(&id).cloned()
    }

    pub fn record_count(&self) -> usize {
        self.lock().records.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Logged calls, oldest first. Always empty unless built with `recording`.
    pub fn calls(&self) -> Vec<StoreCall> {
        self.lock().calls.clone().unwrap_or_default()
    }

    /// Push `revision` to every subscriber of its id again, as an
    /// at-least-once transport may. Returns how many sinks received it.
    pub fn redeliver(&self, revision: ScanRevision) -> usize {
        let mut inner = self.lock();
        notify(&mut inner, &revision)
    }
}

fn notify(inner: &mut Inner, revision: &ScanRevision) -> usize {
    let mut delivered = 0;
    inner.subscribers.retain(|_, (scan_id, sink)| {
        if *scan_id != revision.id {
            return true;
        }
        match sink.send(revision.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            // Receiver is gone; nobody is listening any more
            Err(_) => false,
        }
    });
    delivered
}

fn ensure_available(inner: &Inner) -> Result<(), StoreError> {
    if inner.available {
        Ok(())
    } else {
        Err(StoreError::Unavailable("in-memory store is offline".to_string()))
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn create(&self, record: &ScanRecord) -> Result<Uuid, StoreError> {
        let mut inner = self.lock();
        ensure_available(&inner)?;
        inner.records.insert(record.id, record.clone());
        inner.log(StoreCall::Create(record.id));
        Ok(record.id)
    }

    async fn update(&self, id: Uuid, patch: &ScanPatch) -> Result<(), StoreError> {
        let mut inner = self.lock();
        ensure_available(&inner)?;
        let revision = {
            let record = inner.records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            patch.apply_to(record);
            record.revision()
        };
        inner.log(StoreCall::Update(id, patch.clone()));
        notify(&mut inner, &revision);
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.lock();
        ensure_available(&inner)?;
        inner.records.remove(&id).ok_or(StoreError::NotFound(id))?;
        inner.log(StoreCall::Delete(id));
        Ok(())
    }

    async fn subscribe(
        &self,
        id: Uuid,
        sink: RevisionSink,
    ) -> Result<SubscriptionHandle, StoreError> {
        let mut inner = self.lock();
        ensure_available(&inner)?;
        let current = inner
            .records
            .get(&id)
            .map(ScanRecord::revision)
            .ok_or(StoreError::NotFound(id))?;

        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        // Current state first, so writes racing the subscribe are not lost
        let _ = sink.send(current);
        inner.subscribers.insert(key, (id, sink));
        inner.log(StoreCall::Subscribe(id));
        Ok(SubscriptionHandle::new(id, key))
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        let mut inner = self.lock();
        if inner.subscribers.remove(&handle.key()).is_some() {
            inner.log(StoreCall::Unsubscribe(handle.scan_id()));
        }
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        ensure_available(&self.lock())
    }
}
