//! Session configuration: what to sync, with whom, and how hard to try.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use foliodb_repl_protocol::Credentials;
use foliodb_store::{AttachmentStore, ReplicaStore};

use crate::checkpoint::CheckpointStore;
use crate::resolver::ConflictResolver;
use crate::transport::Connector;

/// Which way revisions flow relative to the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Local changes are sent to the target.
    Push,
    /// Target changes are fetched into the local store.
    Pull,
    /// Both at once.
    PushAndPull,
}

impl Direction {
    /// Whether this direction includes a push pass.
    pub fn wants_push(self) -> bool {
        matches!(self, Direction::Push | Direction::PushAndPull)
    }

    /// Whether this direction includes a pull pass.
    pub fn wants_pull(self) -> bool {
        matches!(self, Direction::Pull | Direction::PushAndPull)
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Direction::Push => "push",
            Direction::Pull => "pull",
            Direction::PushAndPull => "push+pull",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The other end of a replication session.
#[derive(Clone)]
pub enum Endpoint {
    /// Another store in this process. Used for store-to-store sync and
    /// throughout the test suite.
    Local {
        /// The target store.
        store: Arc<dyn ReplicaStore>,
        /// The target's attachment blobs.
        blobs: Arc<dyn AttachmentStore>,
    },
    /// A remote peer addressed by URL. Reaching it requires a
    /// [`Connector`] that knows the scheme.
    Remote {
        /// The peer's address.
        url: String,
    },
}

impl Endpoint {
    /// An in-process endpoint over the given store.
    pub fn local(store: Arc<dyn ReplicaStore>, blobs: Arc<dyn AttachmentStore>) -> Self {
        Endpoint::Local { store, blobs }
    }

    /// A remote endpoint addressed by URL.
    pub fn remote(url: impl Into<String>) -> Self {
        Endpoint::Remote { url: url.into() }
    }

    /// Stable string naming this endpoint for checkpoint identity.
    pub fn descriptor(&self) -> String {
        match self {
            Endpoint::Local { store, .. } => format!("local:{}", store.store_id()),
            Endpoint::Remote { url } => url.clone(),
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Local { store, .. } => {
                write!(f, "Endpoint::Local({})", store.store_id())
            }
            Endpoint::Remote { url } => write!(f, "Endpoint::Remote({url})"),
        }
    }
}

/// Backoff policy for transient failures.
///
/// Delays grow geometrically from `base_delay` by `multiplier` up to
/// `max_delay`, with +/-25% jitter so a fleet of replicators does not
/// reconnect in lockstep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Attempts per operation before the error is surfaced. The first
    /// try counts, so `1` means no retries.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Ceiling for the grown delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Fail immediately on the first transient error.
    pub fn no_retry() -> Self {
        RetryConfig {
            max_attempts: 1,
            ..RetryConfig::default()
        }
    }

    /// Jittered delay before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as f64;
        let grown = base * self.multiplier.powi(attempt.saturating_sub(1).min(24) as i32);
        let capped = grown.min(self.max_delay.as_millis() as f64);
        let jittered = capped * (0.75 + subsec_jitter() * 0.5);
        Duration::from_millis(jittered as u64)
    }
}

/// Uniform-ish value in [0, 1) derived from the clock's sub-second
/// nanoseconds. Good enough to spread reconnects without pulling in a
/// PRNG dependency.
fn subsec_jitter() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    f64::from(nanos % 1000) / 1000.0
}

/// Everything a [`crate::Replicator`] needs to run a session.
///
/// Built with [`ReplicatorConfig::new`] plus `with_*` builders:
///
/// ```ignore
/// let config = ReplicatorConfig::new(store, blobs, endpoint, Direction::PushAndPull)
///     .with_continuous(true)
///     .with_doc_ids(vec!["pet-1".to_string()]);
/// ```
#[derive(Clone)]
pub struct ReplicatorConfig {
    /// The local store revisions are pushed from and pulled into.
    pub local: Arc<dyn ReplicaStore>,
    /// Attachment storage for the local store.
    pub local_blobs: Arc<dyn AttachmentStore>,
    /// The peer to sync with.
    pub target: Endpoint,
    /// Which way revisions flow.
    pub direction: Direction,
    /// One-shot sessions stop at a clean checkpoint; continuous
    /// sessions idle and react to further changes.
    pub continuous: bool,
    /// When set, only these documents replicate and the checkpoint
    /// identity changes accordingly.
    pub doc_ids: Option<Vec<String>>,
    /// Credentials presented during the handshake.
    pub credentials: Option<Credentials>,
    /// Conflict resolver applied on the pulling/active side. `None`
    /// falls back to [`crate::DefaultResolver`].
    pub resolver: Option<Arc<dyn ConflictResolver>>,
    /// Backoff policy for transient transport failures.
    pub retry: RetryConfig,
    /// Maximum changes negotiated per batch.
    pub batch_size: u32,
    /// Where checkpoints persist. `None` uses the local store's
    /// metadata space.
    pub checkpoint_store: Option<Arc<dyn CheckpointStore>>,
    /// How channels to the target are built. `None` uses
    /// [`crate::LocalConnector`], which only reaches
    /// [`Endpoint::Local`] targets.
    pub connector: Option<Arc<dyn Connector>>,
}

impl ReplicatorConfig {
    /// A one-shot session with default retry, batching, and resolver.
    pub fn new(
        local: Arc<dyn ReplicaStore>,
        local_blobs: Arc<dyn AttachmentStore>,
        target: Endpoint,
        direction: Direction,
    ) -> Self {
        ReplicatorConfig {
            local,
            local_blobs,
            target,
            direction,
            continuous: false,
            doc_ids: None,
            credentials: None,
            resolver: None,
            retry: RetryConfig::default(),
            batch_size: 64,
            checkpoint_store: None,
            connector: None,
        }
    }

    /// Keep the session alive after it drains, reacting to new changes.
    pub fn with_continuous(mut self, continuous: bool) -> Self {
        self.continuous = continuous;
        self
    }

    /// Restrict the session to the given document ids.
    pub fn with_doc_ids(mut self, doc_ids: Vec<String>) -> Self {
        self.doc_ids = Some(doc_ids);
        self
    }

    /// Present credentials during the handshake.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Resolve conflicts with a custom policy instead of
    /// [`crate::DefaultResolver`].
    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Override the backoff policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Override the per-batch change limit.
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Persist checkpoints somewhere other than the local store's
    /// metadata space.
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    /// Build channels with a custom connector.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }
}
