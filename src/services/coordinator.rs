//! Scan lifecycle coordinator.
//!
//! A single task owns the one-slot scan state. User calls arrive on a command
//! channel, store deliveries on a revision channel, and one `select!` loop
//! applies them in turn, so no transition ever interleaves with another.
//! Revisions for anything but the active scan id are dropped, which is also
//! what makes `abandon` safe against deliveries that race the unsubscribe.
//! Store calls are awaited inside the loop, so a slow store delays revision
//! handling; revisions queue on the unbounded channel meanwhile.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use uuid::Uuid;

use crate::models::event::{EventKind, LifecycleEvent, ScanSnapshot};
use crate::models::scan::{ScanPatch, ScanRecord, ScanRevision, ScanStatus};
use crate::services::mirror::{ScanMirror, Transition};
use crate::services::preprocess::{ImagePreprocessor, PreprocessError};
use crate::services::store::{RecordStore, RevisionSink, StoreError, SubscriptionHandle};

const COMMAND_CAPACITY: usize = 16;

type Reply<T> = oneshot::Sender<Result<T, CoordinatorError>>;

enum Command {
    Submit { image: Vec<u8>, reply: Reply<Uuid> },
    Abandon { reply: Reply<()> },
    Shutdown { reply: Reply<()> },
    Stop { reply: Reply<()> },
}

/// Handle to the coordinator task. Cheap to clone; when the last handle is
/// dropped the task tears down any active scan and exits.
#[derive(Clone)]
pub struct Coordinator {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<LifecycleEvent>,
    snapshot: watch::Receiver<Option<ScanSnapshot>>,
    preprocessor: ImagePreprocessor,
}

impl Coordinator {
    /// Start the coordinator task on the current tokio runtime.
    pub fn spawn(
        store: Arc<dyn RecordStore>,
        preprocessor: ImagePreprocessor,
        event_capacity: usize,
    ) -> Self {
        let (handle, task) = Self::build(store, preprocessor, event_capacity);
        tokio::spawn(task.run());
        handle
    }

    fn build(
        store: Arc<dyn RecordStore>,
        preprocessor: ImagePreprocessor,
        event_capacity: usize,
    ) -> (Self, CoordinatorTask) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (revision_tx, revision_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(event_capacity.max(1));
        let (snapshot_tx, snapshot_rx) = watch::channel(None);

        let handle = Self {
            commands: command_tx,
            events: events.clone(),
            snapshot: snapshot_rx,
            preprocessor,
        };
        let task = CoordinatorTask {
            store,
            commands: command_rx,
            revisions: revision_rx,
            revision_sink: revision_tx,
            events,
            snapshot: snapshot_tx,
            active: None,
        };
        (handle, task)
    }

    /// Preprocess `image` and start scanning it, abandoning any scan that is
    /// still active. Preprocessing errors return before anything is written
    /// to the store.
    pub async fn submit(&self, image: &[u8]) -> Result<Uuid, CoordinatorError> {
        let preprocessor = self.preprocessor;
        let raw = image.to_vec();
        let processed = tokio::task::spawn_blocking(move || preprocessor.reduce(&raw)).await??;

        self.request(|reply| Command::Submit {
            image: processed,
            reply,
        })
        .await
    }

    /// Delete the active scan and release the slot. No-op when idle.
    pub async fn abandon(&self) -> Result<(), CoordinatorError> {
        self.request(|reply| Command::Abandon { reply }).await
    }

    /// Abandon the active scan and stop the task. If the record cannot be
    /// deleted the task keeps running with the scan still active, and the
    /// call may be retried.
    pub async fn shutdown(&self) -> Result<(), CoordinatorError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    /// Stop the task unconditionally. The active scan is abandoned if the
    /// store allows; otherwise its record is left behind and the error is
    /// returned, but the subscription is closed either way.
    pub async fn stop(&self) -> Result<(), CoordinatorError> {
        self.request(|reply| Command::Stop { reply }).await
    }

    /// Subscribe to lifecycle events from now on.
    pub fn events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// The active scan as of the last transition.
    pub fn snapshot(&self) -> Option<ScanSnapshot> {
        self.snapshot.borrow().clone()
    }

    /// Aggregated result text of the active scan.
    pub fn aggregated_text(&self) -> Option<String> {
        self.snapshot().map(|s| s.summary)
    }

    /// Resolves once the coordinator task has exited.
    pub async fn stopped(&self) {
        let mut snapshot = self.snapshot.clone();
        // The task owns the sender; changes end with an error when it drops
        while snapshot.changed().await.is_ok() {}
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, CoordinatorError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| CoordinatorError::Stopped)?;
        response.await.map_err(|_| CoordinatorError::Stopped)?
    }
}

struct ActiveScan {
    mirror: ScanMirror,
    subscription: SubscriptionHandle,
    submitted_at: Instant,
}

struct CoordinatorTask {
    store: Arc<dyn RecordStore>,
    commands: mpsc::Receiver<Command>,
    revisions: mpsc::UnboundedReceiver<ScanRevision>,
    revision_sink: RevisionSink,
    events: broadcast::Sender<LifecycleEvent>,
    snapshot: watch::Sender<Option<ScanSnapshot>>,
    active: Option<ActiveScan>,
}

impl CoordinatorTask {
    async fn run(mut self) {
        tracing::info!("Scan coordinator started");
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(Command::Submit { image, reply }) => {
                        let _ = reply.send(self.submit(image).await);
                    }
                    Some(Command::Abandon { reply }) => {
                        let _ = reply.send(self.abandon().await);
                    }
                    Some(Command::Shutdown { reply }) => match self.abandon().await {
                        Ok(()) => {
                            let _ = reply.send(Ok(()));
                            break;
                        }
                        // Keep running so the caller can retry the teardown
                        Err(e) => {
                            tracing::warn!(error = %e, "Shutdown deferred, active scan not released");
                            let _ = reply.send(Err(e));
                        }
                    },
                    Some(Command::Stop { reply }) => {
                        let _ = reply.send(self.teardown().await);
                        break;
                    }
                    None => {
                        let _ = self.teardown().await;
                        break;
                    }
                },
                Some(revision) = self.revisions.recv() => self.on_remote_update(revision).await,
            }
        }
        tracing::info!("Scan coordinator stopped");
    }

    async fn submit(&mut self, image: Vec<u8>) -> Result<Uuid, CoordinatorError> {
        if let Some(active) = &self.active {
            tracing::info!(scan_id = %active.mirror.id(), "Abandoning active scan for new submission");
            self.abandon().await?;
        }

        let record = ScanRecord::new(image);
        let id = self.store.create(&record).await?;

        let subscription = match self.store.subscribe(id, self.revision_sink.clone()).await {
            Ok(subscription) => subscription,
            Err(e) => {
                tracing::error!(scan_id = %id, error = %e, "Failed to subscribe to scan record");
                if let Err(cleanup) = self.store.delete(id).await {
                    tracing::warn!(scan_id = %id, error = %cleanup, "Failed to delete unsubscribed scan record");
                }
                return Err(e.into());
            }
        };

        let mirror = ScanMirror::new(id);
        let snapshot = mirror.snapshot();
        self.active = Some(ActiveScan {
            mirror,
            subscription,
            submitted_at: Instant::now(),
        });

        metrics::counter!("scan_jobs_submitted").increment(1);
        tracing::info!(scan_id = %id, image_bytes = record.image_data.len(), "Scan submitted");

        self.publish(EventKind::Submitted, snapshot);
        Ok(id)
    }

    async fn on_remote_update(&mut self, revision: ScanRevision) {
        let Some(active) = self.active.as_mut() else {
            tracing::debug!(scan_id = %revision.id, "Dropping revision, no active scan");
            return;
        };
        if active.mirror.id() != revision.id {
            tracing::debug!(
                scan_id = %revision.id,
                active_scan_id = %active.mirror.id(),
                "Dropping revision for inactive scan"
            );
            return;
        }

        let transition = active.mirror.merge(&revision);
        let snapshot = active.mirror.snapshot();
        let elapsed = active.submitted_at.elapsed();
        let id = revision.id;

        match transition {
            Transition::Unchanged => {}
            Transition::Progressed => {
                tracing::debug!(scan_id = %id, status = %snapshot.status, "Scan progressed");
                self.publish(EventKind::Progressed, snapshot);
            }
            Transition::Completed => {
                metrics::counter!("scan_jobs_completed").increment(1);
                metrics::histogram!("scan_resolution_seconds").record(elapsed.as_secs_f64());
                tracing::info!(scan_id = %id, elapsed_ms = elapsed.as_millis(), "Scan completed");
                self.publish(EventKind::Completed, snapshot);

                // Status only ever moves forward, so racing a late analyzer
                // write here is harmless
                if let Err(e) = self
                    .store
                    .update(id, &ScanPatch::status(ScanStatus::Completed))
                    .await
                {
                    tracing::warn!(scan_id = %id, error = %e, "Failed to record completion in store");
                }
            }
            Transition::Failed => {
                metrics::counter!("scan_jobs_failed").increment(1);
                tracing::warn!(scan_id = %id, "Analyzer reported scan failure");
                self.publish(EventKind::Failed, snapshot);

                if let Err(e) = self.abandon().await {
                    tracing::error!(scan_id = %id, error = %e, "Failed to tear down failed scan");
                }
            }
        }
    }

    async fn abandon(&mut self) -> Result<(), CoordinatorError> {
        let Some(id) = self.active.as_ref().map(|a| a.mirror.id()) else {
            return Ok(());
        };

        match self.store.delete(id).await {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => {
                tracing::debug!(scan_id = %id, "Scan record already gone");
            }
            // Still active and subscribed; the caller may retry
            Err(e) => {
                tracing::warn!(scan_id = %id, error = %e, "Failed to delete scan record");
                return Err(e.into());
            }
        }

        if let Some(active) = self.active.take() {
            self.store.unsubscribe(active.subscription).await;

            let snapshot = active.mirror.snapshot();
            if !snapshot.status.is_terminal() {
                metrics::counter!("scan_jobs_abandoned").increment(1);
            }
            tracing::info!(scan_id = %id, status = %snapshot.status, "Scan released");

            let _ = self.events.send(LifecycleEvent::new(EventKind::Released, &snapshot));
            self.snapshot.send_replace(None);
        }
        Ok(())
    }

    /// Abandon for exit paths that cannot be retried: if the record cannot
    /// be deleted it is left in the store, but the subscription still closes.
    async fn teardown(&mut self) -> Result<(), CoordinatorError> {
        let result = self.abandon().await;
        if let Err(e) = &result {
            if let Some(active) = self.active.take() {
                tracing::error!(scan_id = %active.mirror.id(), error = %e, "Scan record left in store");
                self.store.unsubscribe(active.subscription).await;
                self.snapshot.send_replace(None);
            }
        }
        result
    }

    fn publish(&self, kind: EventKind, snapshot: ScanSnapshot) {
        // No receivers is fine
        let _ = self.events.send(LifecycleEvent::new(kind, &snapshot));
        self.snapshot.send_replace(Some(snapshot));
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Image preprocessing failed: {0}")]
    Preprocess(#[from] PreprocessError),

    #[error("Record store error: {0}")]
    Store(#[from] StoreError),

    #[error("Preprocessing task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Scan coordinator is not running")]
    Stopped,
}
