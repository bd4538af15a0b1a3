//! Listener registration and change-event delivery.
//!
//! Events are delivered through an [`ExecutionContext`] so application
//! callbacks never run while replicator locks are held. The default
//! context is a single background thread, which preserves event order
//! across every listener of one replicator.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use parking_lot::Mutex;

type Job = Box<dyn FnOnce() + Send>;

/// Where listener callbacks run.
pub trait ExecutionContext: Send + Sync {
    /// Run `task`, now or later. Tasks submitted from one thread must
    /// execute in submission order.
    fn execute(&self, task: Job);
}

/// Runs callbacks on a dedicated background thread, in order.
pub struct BackgroundExecutor {
    tx: Mutex<mpsc::Sender<Job>>,
}

impl BackgroundExecutor {
    /// Spawn the executor thread under the given name.
    pub fn new(name: &str) -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    job();
                }
            })
            .expect("spawn executor thread");
        BackgroundExecutor { tx: Mutex::new(tx) }
    }
}

impl ExecutionContext for BackgroundExecutor {
    fn execute(&self, task: Job) {
        // A send failure means the thread is gone at process teardown;
        // dropping the task is the only option left.
        let _ = self.tx.lock().send(task);
    }
}

/// Runs callbacks on the calling thread. Useful in tests and for
/// callers that manage their own dispatch.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineExecutor;

impl ExecutionContext for InlineExecutor {
    fn execute(&self, task: Job) {
        task();
    }
}

/// Handle for removing a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerToken(u64);

struct ListenerEntry<E> {
    token: u64,
    /// Set on unsubscribe; checked again at delivery time so a removed
    /// listener stops firing even with events already queued.
    dead: Arc<AtomicBool>,
    context: Arc<dyn ExecutionContext>,
    callback: Arc<dyn Fn(E) + Send + Sync>,
}

/// Fan-out of events to registered listeners.
pub(crate) struct Notifier<E> {
    listeners: Mutex<Vec<ListenerEntry<E>>>,
    next_token: AtomicU64,
    default_context: Arc<dyn ExecutionContext>,
}

impl<E: Clone + Send + 'static> Notifier<E> {
    pub(crate) fn new(default_context: Arc<dyn ExecutionContext>) -> Self {
        Notifier {
            listeners: Mutex::new(Vec::new()),
            next_token: AtomicU64::new(1),
            default_context,
        }
    }

    /// Register a listener on the notifier's default context.
    pub(crate) fn subscribe(
        &self,
        callback: impl Fn(E) + Send + Sync + 'static,
    ) -> ListenerToken {
        self.subscribe_with(None, callback)
    }

    /// Register a listener on a caller-supplied context.
    pub(crate) fn subscribe_with(
        &self,
        context: Option<Arc<dyn ExecutionContext>>,
        callback: impl Fn(E) + Send + Sync + 'static,
    ) -> ListenerToken {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let entry = ListenerEntry {
            token,
            dead: Arc::new(AtomicBool::new(false)),
            context: context.unwrap_or_else(|| self.default_context.clone()),
            callback: Arc::new(callback),
        };
        self.listeners.lock().push(entry);
        ListenerToken(token)
    }

    /// Remove a listener. Safe to call from inside a callback.
    pub(crate) fn unsubscribe(&self, token: ListenerToken) {
        let mut listeners = self.listeners.lock();
        if let Some(pos) = listeners.iter().position(|e| e.token == token.0) {
            listeners[pos].dead.store(true, Ordering::Release);
            listeners.remove(pos);
        }
    }

    /// Deliver `event` to every listener. The listener list is
    /// snapshotted first and callbacks run through their contexts, so
    /// a callback may subscribe or unsubscribe without deadlocking.
    pub(crate) fn post(&self, event: E) {
        let snapshot: Vec<_> = {
            let listeners = self.listeners.lock();
            listeners
                .iter()
                .map(|e| (e.dead.clone(), e.context.clone(), e.callback.clone()))
                .collect()
        };
        for (dead, context, callback) in snapshot {
            let event = event.clone();
            context.execute(Box::new(move || {
                if dead.load(Ordering::Acquire) {
                    return;
                }
                if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                    tracing::warn!("change listener panicked");
                }
            }));
        }
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}
