//! # FolioDB Replicator
//!
//! Moves document revisions between a local [`foliodb_store`] replica
//! and another store, in either or both directions, once or
//! continuously.
//!
//! A session is driven by the active side: it polls the peer's change
//! log, transfers what is missing, grafts remote branches into the
//! local revision trees, settles any conflicts with a pluggable
//! [`ConflictResolver`], and persists a [`Checkpoint`] so the next
//! session resumes instead of rescanning. Identical edits made on
//! different replicas derive identical revision ids, so convergence
//! needs no coordination.
//!
//! ```no_run
//! use std::sync::Arc;
//! use foliodb_replicator::{Direction, Endpoint, Replicator, ReplicatorConfig};
//! use foliodb_store::MemoryStore;
//!
//! let local = MemoryStore::new();
//! let team = MemoryStore::new();
//! let config = ReplicatorConfig::new(
//!     Arc::new(local.clone()),
//!     Arc::new(local.blobs()),
//!     Endpoint::local(Arc::new(team.clone()), Arc::new(team.blobs())),
//!     Direction::PushAndPull,
//! );
//! let replicator = Replicator::new(config);
//! replicator.start().expect("start replication");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod checkpoint;
mod config;
mod error;
mod notifier;
mod pipeline;
mod replicator;
mod resolver;
mod responder;
mod status;
mod transport;

pub use checkpoint::{
    Checkpoint, CheckpointStore, LocalMetaCheckpointStore, MemoryCheckpointStore, SessionIdentity,
};
pub use config::{Direction, Endpoint, ReplicatorConfig, RetryConfig};
pub use error::{ReplicatorError, ReplicatorResult};
pub use notifier::{BackgroundExecutor, ExecutionContext, InlineExecutor, ListenerToken};
pub use replicator::{DocumentEvent, Replicator, ReplicatorChange};
pub use resolver::{
    ConflictBodies, ConflictResolver, DefaultResolver, MergeResolver, Resolution, ResolveError,
    RevisionView,
};
pub use responder::Responder;
pub use status::{Activity, Progress, ReplicatorStatus};
pub use transport::{Channel, Connector, LocalChannel, LocalConnector, MockChannel};

pub use foliodb_repl_protocol::Credentials;
