//! The replicator's control plane.
//!
//! [`Replicator::start`] spawns a session thread that connects,
//! hands the channel to a [`Pipeline`], and walks the activity state
//! machine: CONNECTING, then BUSY while batches move, IDLE when both
//! sides agree, OFFLINE with backoff when a continuous session loses
//! its connection, STOPPED at the end. One-shot sessions stop at the
//! first idle point; continuous sessions stay up, woken by the change
//! feeds of the stores involved.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use foliodb_store::ReplicaStore;

use crate::checkpoint::{Checkpoint, CheckpointStore, LocalMetaCheckpointStore, SessionIdentity};
use crate::config::{Endpoint, ReplicatorConfig};
use crate::error::{ReplicatorError, ReplicatorResult};
use crate::notifier::{BackgroundExecutor, ExecutionContext, ListenerToken, Notifier};
use crate::pipeline::{handshake, Pipeline};
use crate::resolver::{ConflictResolver, DefaultResolver};
use crate::status::{Activity, Progress, ReplicatorStatus};
use crate::transport::{Channel, Connector, LocalConnector};

/// Interval at which an idle continuous session re-checks its peer
/// even without a change feed wakeup.
const IDLE_POLL: Duration = Duration::from_millis(200);

/// A status snapshot delivered to change listeners.
#[derive(Debug, Clone)]
pub struct ReplicatorChange {
    /// The replicator's status after the transition.
    pub status: ReplicatorStatus,
}

/// Outcome of replicating one document, delivered to document
/// listeners and kept in the error log when it failed.
#[derive(Debug, Clone)]
pub struct DocumentEvent {
    /// The document that was replicated.
    pub doc_id: String,
    /// True when the document moved outward, false when it was pulled.
    pub pushing: bool,
    /// Whether the replicated revision is a deletion.
    pub deleted: bool,
    /// The document-scoped failure, `None` on success.
    pub error: Option<ReplicatorError>,
}

/// Messages for the session thread.
pub(crate) enum Control {
    /// A change feed saw a new commit.
    Wake,
    /// [`Replicator::stop`] was called.
    Stop,
    /// One of the stores involved closed underneath us.
    StoreClosed,
}

/// State shared between the [`Replicator`] handle, the session thread,
/// and the pipeline.
pub(crate) struct Inner {
    pub(crate) config: ReplicatorConfig,
    pub(crate) resolver: Arc<dyn ConflictResolver>,
    pub(crate) checkpoints: Arc<dyn CheckpointStore>,
    connector: Arc<dyn Connector>,
    status: RwLock<ReplicatorStatus>,
    changes: Notifier<ReplicatorChange>,
    documents: Notifier<DocumentEvent>,
    doc_errors: Mutex<Vec<DocumentEvent>>,
    stop_requested: AtomicBool,
    store_closed: AtomicBool,
    control_tx: Mutex<Option<mpsc::Sender<Control>>>,
}

impl Inner {
    pub(crate) fn build(config: ReplicatorConfig) -> Arc<Inner> {
        let resolver = config
            .resolver
            .clone()
            .unwrap_or_else(|| Arc::new(DefaultResolver));
        let checkpoints = config
            .checkpoint_store
            .clone()
            .unwrap_or_else(|| Arc::new(LocalMetaCheckpointStore::new(config.local.clone())));
        let connector = config
            .connector
            .clone()
            .unwrap_or_else(|| Arc::new(LocalConnector));
        // Both notifiers share one executor thread so status changes
        // and document events reach listeners in the order they were
        // posted.
        let context: Arc<dyn ExecutionContext> =
            Arc::new(BackgroundExecutor::new("folio-repl-notify"));
        Arc::new(Inner {
            config,
            resolver,
            checkpoints,
            connector,
            status: RwLock::new(ReplicatorStatus::default()),
            changes: Notifier::new(context.clone()),
            documents: Notifier::new(context),
            doc_errors: Mutex::new(Vec::new()),
            stop_requested: AtomicBool::new(false),
            store_closed: AtomicBool::new(false),
            control_tx: Mutex::new(None),
        })
    }

    pub(crate) fn snapshot(&self) -> ReplicatorStatus {
        self.status.read().clone()
    }

    fn transition(&self, next: Activity, error: Option<ReplicatorError>) {
        let snapshot = {
            let mut status = self.status.write();
            if status.activity == next {
                if error.is_none() {
                    return;
                }
                status.error = error;
            } else {
                if !status.activity.can_transition_to(next) {
                    tracing::error!(
                        from = %status.activity,
                        to = %next,
                        "illegal activity transition ignored"
                    );
                    return;
                }
                status.activity = next;
                status.error = error;
            }
            status.clone()
        };
        tracing::debug!(activity = %snapshot.activity, "replicator state changed");
        self.changes.post(ReplicatorChange { status: snapshot });
    }

    pub(crate) fn note_busy(&self) {
        self.transition(Activity::Busy, None);
    }

    pub(crate) fn add_progress(&self, total: u64, completed: u64) {
        let snapshot = {
            let mut status = self.status.write();
            status.progress.total += total;
            status.progress.completed += completed;
            status.clone()
        };
        self.changes.post(ReplicatorChange { status: snapshot });
    }

    fn reset_progress(&self) {
        self.status.write().progress = Progress::default();
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    pub(crate) fn store_closed(&self) -> bool {
        self.store_closed.load(Ordering::Acquire) || !self.config.local.is_open()
    }

    pub(crate) fn check_interrupt(&self) -> ReplicatorResult<()> {
        if self.store_closed() {
            return Err(ReplicatorError::StoreUnavailable);
        }
        if self.stop_requested() {
            return Err(ReplicatorError::Cancelled);
        }
        Ok(())
    }

    /// Sleep in small slices so stop requests and store closure cut
    /// backoff waits short.
    pub(crate) fn sleep_cancellable(&self, duration: Duration) -> ReplicatorResult<()> {
        let deadline = Instant::now() + duration;
        loop {
            self.check_interrupt()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep((deadline - now).min(Duration::from_millis(25)));
        }
    }

    pub(crate) fn post_document_event(&self, event: DocumentEvent) {
        match &event.error {
            Some(error) => {
                tracing::warn!(
                    doc = %event.doc_id,
                    pushing = event.pushing,
                    %error,
                    "document replication failed"
                );
                self.doc_errors.lock().push(event.clone());
            }
            None => {
                tracing::debug!(doc = %event.doc_id, pushing = event.pushing, "document replicated");
            }
        }
        self.documents.post(event);
    }
}

/// Replicates documents between a local store and an endpoint.
///
/// All methods take `&self`; dropping the handle stops any running
/// session.
pub struct Replicator {
    inner: Arc<Inner>,
}

impl Replicator {
    /// Create a replicator for `config`. Nothing happens until
    /// [`start`](Replicator::start).
    pub fn new(config: ReplicatorConfig) -> Self {
        Replicator {
            inner: Inner::build(config),
        }
    }

    /// The configuration this replicator was built with.
    pub fn config(&self) -> &ReplicatorConfig {
        &self.inner.config
    }

    /// Current activity, progress and error snapshot.
    pub fn status(&self) -> ReplicatorStatus {
        self.inner.snapshot()
    }

    /// Spawn the session thread. Fails with
    /// [`ReplicatorError::InvalidState`] while a session is running.
    pub fn start(&self) -> ReplicatorResult<()> {
        let mut slot = self.inner.control_tx.lock();
        if slot.is_some() {
            return Err(ReplicatorError::InvalidState {
                operation: "start".to_string(),
                activity: self.inner.snapshot().activity.to_string(),
            });
        }
        let (tx, rx) = mpsc::channel();
        self.inner.stop_requested.store(false, Ordering::Release);
        self.inner.store_closed.store(false, Ordering::Release);
        self.inner.doc_errors.lock().clear();
        register_close_hooks(&self.inner, &tx);
        let wake_tx = tx.clone();
        *slot = Some(tx);
        drop(slot);

        let inner = self.inner.clone();
        thread::Builder::new()
            .name("folio-repl-session".to_string())
            .spawn(move || run_session(inner, wake_tx, rx))
            .expect("spawn replicator session thread");
        Ok(())
    }

    /// Ask the session to stop. Returns immediately; the transition to
    /// STOPPED is observable through [`status`](Replicator::status) and
    /// change listeners. Stopping a stopped replicator does nothing.
    pub fn stop(&self) {
        self.inner.stop_requested.store(true, Ordering::Release);
        let slot = self.inner.control_tx.lock();
        if let Some(tx) = slot.as_ref() {
            let _ = tx.send(Control::Stop);
        }
    }

    /// Register a status listener on the shared notification thread.
    pub fn add_change_listener(
        &self,
        callback: impl Fn(ReplicatorChange) + Send + Sync + 'static,
    ) -> ListenerToken {
        self.inner.changes.subscribe(callback)
    }

    /// Register a status listener with its own execution context.
    pub fn add_change_listener_with(
        &self,
        context: Arc<dyn ExecutionContext>,
        callback: impl Fn(ReplicatorChange) + Send + Sync + 'static,
    ) -> ListenerToken {
        self.inner.changes.subscribe_with(Some(context), callback)
    }

    /// Remove a status listener. Events already queued for it are
    /// dropped at delivery.
    pub fn remove_change_listener(&self, token: ListenerToken) {
        self.inner.changes.unsubscribe(token);
    }

    /// Register a per-document listener on the shared notification
    /// thread.
    pub fn add_document_listener(
        &self,
        callback: impl Fn(DocumentEvent) + Send + Sync + 'static,
    ) -> ListenerToken {
        self.inner.documents.subscribe(callback)
    }

    /// Register a per-document listener with its own execution context.
    pub fn add_document_listener_with(
        &self,
        context: Arc<dyn ExecutionContext>,
        callback: impl Fn(DocumentEvent) + Send + Sync + 'static,
    ) -> ListenerToken {
        self.inner.documents.subscribe_with(Some(context), callback)
    }

    /// Remove a per-document listener.
    pub fn remove_document_listener(&self, token: ListenerToken) {
        self.inner.documents.unsubscribe(token);
    }

    /// Document-scoped failures recorded since the last
    /// [`start`](Replicator::start).
    pub fn document_errors(&self) -> Vec<DocumentEvent> {
        self.inner.doc_errors.lock().clone()
    }

    /// Forget the saved checkpoint so the next session scans from the
    /// beginning. Only allowed while stopped.
    pub fn reset_checkpoint(&self) -> ReplicatorResult<()> {
        let slot = self.inner.control_tx.lock();
        if slot.is_some() {
            return Err(ReplicatorError::InvalidState {
                operation: "reset_checkpoint".to_string(),
                activity: self.inner.snapshot().activity.to_string(),
            });
        }
        let identity = SessionIdentity::derive(&self.inner.config);
        self.inner.checkpoints.reset(&identity)
    }
}

impl Drop for Replicator {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Wire store closure into the control channel so a session does not
/// keep spinning against a closed store.
fn register_close_hooks(inner: &Arc<Inner>, tx: &mpsc::Sender<Control>) {
    let mut stores: Vec<Arc<dyn ReplicaStore>> = vec![inner.config.local.clone()];
    if let Endpoint::Local { store, .. } = &inner.config.target {
        stores.push(store.clone());
    }
    for store in stores {
        let weak = Arc::downgrade(inner);
        let tx = tx.clone();
        store.on_close(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.store_closed.store(true, Ordering::Release);
            }
            let _ = tx.send(Control::StoreClosed);
        }));
    }
}

fn run_session(inner: Arc<Inner>, wake_tx: mpsc::Sender<Control>, control: mpsc::Receiver<Control>) {
    let session = Uuid::new_v4();
    tracing::info!(
        %session,
        direction = %inner.config.direction,
        continuous = inner.config.continuous,
        "replication session starting"
    );
    let done = Arc::new(AtomicBool::new(false));
    let mut feeds = Vec::new();
    if inner.config.continuous {
        feeds.push(spawn_feed(
            inner.config.local.subscribe_changes(),
            wake_tx.clone(),
            done.clone(),
        ));
        if let Endpoint::Local { store, .. } = &inner.config.target {
            feeds.push(spawn_feed(store.subscribe_changes(), wake_tx.clone(), done.clone()));
        }
    }
    drop(wake_tx);

    let error = session_loop(&inner, &control);
    match &error {
        Some(failure) => tracing::warn!(%session, error = %failure, "replication session ended"),
        None => tracing::info!(%session, "replication session ended"),
    }
    done.store(true, Ordering::Release);
    {
        // Publish STOPPED and free the start slot under one lock so a
        // caller that just observed STOPPED can start again without
        // hitting InvalidState.
        let mut slot = inner.control_tx.lock();
        inner.transition(Activity::Stopped, error);
        *slot = None;
    }
    for feed in feeds {
        let _ = feed.join();
    }
}

/// Forward committed sequences from a store's change feed to the
/// session as wakeups.
fn spawn_feed(
    feed: mpsc::Receiver<u64>,
    tx: mpsc::Sender<Control>,
    done: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("folio-repl-feed".to_string())
        .spawn(move || loop {
            match feed.recv_timeout(Duration::from_millis(500)) {
                Ok(_) => {
                    if tx.send(Control::Wake).is_err() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if done.load(Ordering::Acquire) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        })
        .expect("spawn change feed thread")
}

enum AttemptEnd {
    Completed,
    StopRequested,
    StoreClosed,
}

enum IdleEnd {
    Work,
    Stop,
    StoreClosed,
}

enum OfflineWait {
    Retry,
    Stop,
    StoreClosed,
}

/// Runs attempts until one finishes the session, reconnecting with
/// backoff when a continuous session loses its connection. Returns the
/// error the session stopped with, if any.
fn session_loop(inner: &Arc<Inner>, control: &mpsc::Receiver<Control>) -> Option<ReplicatorError> {
    let mut reconnect_attempt: u32 = 0;
    loop {
        match run_attempt(inner, control, &mut reconnect_attempt) {
            Ok(AttemptEnd::Completed | AttemptEnd::StopRequested) => return None,
            Ok(AttemptEnd::StoreClosed) => return Some(ReplicatorError::StoreUnavailable),
            Err(error) => {
                // A store closing mid-operation surfaces as whatever
                // failed first; report the underlying condition.
                let error = if inner.store_closed() {
                    ReplicatorError::StoreUnavailable
                } else {
                    error
                };
                if matches!(error, ReplicatorError::Cancelled) {
                    return None;
                }
                if inner.config.continuous
                    && error.is_retryable()
                    && !inner.stop_requested()
                    && !inner.store_closed()
                {
                    reconnect_attempt += 1;
                    let delay = inner
                        .config
                        .retry
                        .delay_for_attempt(reconnect_attempt.min(16));
                    tracing::warn!(
                        %error,
                        attempt = reconnect_attempt,
                        delay_ms = delay.as_millis() as u64,
                        "connection lost, waiting to reconnect"
                    );
                    inner.transition(Activity::Offline, Some(error));
                    match wait_offline(control, delay) {
                        OfflineWait::Retry => continue,
                        OfflineWait::Stop => return None,
                        OfflineWait::StoreClosed => {
                            inner.store_closed.store(true, Ordering::Release);
                            return Some(ReplicatorError::StoreUnavailable);
                        }
                    }
                }
                return Some(error);
            }
        }
    }
}

fn run_attempt(
    inner: &Arc<Inner>,
    control: &mpsc::Receiver<Control>,
    reconnect_attempt: &mut u32,
) -> Result<AttemptEnd, ReplicatorError> {
    inner.reset_progress();
    inner.transition(Activity::Connecting, None);
    if inner.store_closed() {
        return Ok(AttemptEnd::StoreClosed);
    }
    if inner.stop_requested() {
        return Ok(AttemptEnd::StopRequested);
    }

    let identity = SessionIdentity::derive(&inner.config);
    let checkpoint = match inner.checkpoints.load(&identity) {
        Ok(found) => found.unwrap_or_default(),
        Err(ReplicatorError::BadCheckpoint { reason }) => {
            tracing::warn!(reason = %reason, "stored checkpoint rejected, starting from scratch");
            inner.checkpoints.reset(&identity)?;
            Checkpoint::default()
        }
        Err(other) => return Err(other),
    };

    let channel = connect_with_retry(inner)?;
    *reconnect_attempt = 0;
    let mut pipeline = Pipeline::new(inner, channel, checkpoint, identity);

    loop {
        if inner.store_closed() {
            return Ok(AttemptEnd::StoreClosed);
        }
        if inner.stop_requested() {
            return Ok(AttemptEnd::StopRequested);
        }
        let moved = pipeline.run_cycle()?;
        if moved > 0 {
            // More may have queued behind the batch we just moved.
            continue;
        }
        inner.transition(Activity::Idle, None);
        if !inner.config.continuous {
            return Ok(AttemptEnd::Completed);
        }
        match wait_while_idle(inner, control, &mut pipeline)? {
            IdleEnd::Work => continue,
            IdleEnd::Stop => return Ok(AttemptEnd::StopRequested),
            IdleEnd::StoreClosed => return Ok(AttemptEnd::StoreClosed),
        }
    }
}

fn connect_with_retry(inner: &Arc<Inner>) -> ReplicatorResult<Box<dyn Channel>> {
    let retry = inner.config.retry;
    let mut attempt = 1u32;
    loop {
        inner.check_interrupt()?;
        let result = inner
            .connector
            .connect(&inner.config.target)
            .and_then(|mut channel| {
                handshake(channel.as_mut(), &inner.config)?;
                Ok(channel)
            });
        match result {
            Ok(channel) => return Ok(channel),
            Err(error) if error.is_retryable() && attempt < retry.max_attempts => {
                let delay = retry.delay_for_attempt(attempt);
                tracing::warn!(
                    %error,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "connect failed, backing off"
                );
                inner.sleep_cancellable(delay)?;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

fn wait_while_idle(
    inner: &Arc<Inner>,
    control: &mpsc::Receiver<Control>,
    pipeline: &mut Pipeline<'_>,
) -> Result<IdleEnd, ReplicatorError> {
    loop {
        match control.recv_timeout(IDLE_POLL) {
            Ok(Control::Stop) => return Ok(IdleEnd::Stop),
            Ok(Control::StoreClosed) => return Ok(IdleEnd::StoreClosed),
            Ok(Control::Wake) | Err(RecvTimeoutError::Timeout) => {
                if inner.store_closed() {
                    return Ok(IdleEnd::StoreClosed);
                }
                if inner.stop_requested() {
                    return Ok(IdleEnd::Stop);
                }
                if pipeline.probe_pending()? {
                    return Ok(IdleEnd::Work);
                }
            }
            Err(RecvTimeoutError::Disconnected) => return Ok(IdleEnd::Stop),
        }
    }
}

fn wait_offline(control: &mpsc::Receiver<Control>, delay: Duration) -> OfflineWait {
    let deadline = Instant::now() + delay;
    loop {
        let now = Instant::now();
        if now >= deadline {
            return OfflineWait::Retry;
        }
        let slice = (deadline - now).min(Duration::from_millis(100));
        match control.recv_timeout(slice) {
            // New work is a reason to try the connection again early.
            Ok(Control::Wake) => return OfflineWait::Retry,
            Ok(Control::Stop) => return OfflineWait::Stop,
            Ok(Control::StoreClosed) => return OfflineWait::StoreClosed,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return OfflineWait::Stop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use foliodb_store::MemoryStore;

    use crate::config::Direction;

    fn wait_for(replicator: &Replicator, activity: Activity) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if replicator.status().activity == activity {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!(
            "timed out waiting for {activity}, still {}",
            replicator.status().activity
        );
    }

    fn pair_config(local: &MemoryStore, target: &MemoryStore, direction: Direction) -> ReplicatorConfig {
        ReplicatorConfig::new(
            Arc::new(local.clone()),
            Arc::new(local.blobs()),
            Endpoint::local(Arc::new(target.clone()), Arc::new(target.blobs())),
            direction,
        )
    }

    #[test]
    fn start_while_running_is_rejected() {
        let local = MemoryStore::new();
        let target = MemoryStore::new();
        let replicator = Replicator::new(
            pair_config(&local, &target, Direction::PushAndPull).with_continuous(true),
        );
        replicator.start().expect("first start");
        let err = replicator.start().expect_err("second start must fail");
        assert!(matches!(err, ReplicatorError::InvalidState { .. }));
        replicator.stop();
        wait_for(&replicator, Activity::Stopped);
    }

    #[test]
    fn one_shot_with_nothing_to_do_stops_clean() {
        let local = MemoryStore::new();
        let target = MemoryStore::new();
        let replicator = Replicator::new(pair_config(&local, &target, Direction::PushAndPull));
        replicator.start().expect("start");
        wait_for(&replicator, Activity::Stopped);
        let status = replicator.status();
        assert!(status.error.is_none(), "unexpected error: {:?}", status.error);
        assert_eq!(status.progress.total, 0);
    }

    #[test]
    fn reset_checkpoint_only_while_stopped() {
        let local = MemoryStore::new();
        let target = MemoryStore::new();
        let replicator = Replicator::new(
            pair_config(&local, &target, Direction::Push).with_continuous(true),
        );
        replicator.start().expect("start");
        wait_for(&replicator, Activity::Idle);
        let err = replicator.reset_checkpoint().expect_err("must refuse while running");
        assert!(matches!(err, ReplicatorError::InvalidState { .. }));
        replicator.stop();
        wait_for(&replicator, Activity::Stopped);
        replicator.reset_checkpoint().expect("reset while stopped");
    }
}
