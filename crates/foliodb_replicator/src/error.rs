//! Error types for replication sessions.

use foliodb_repl_protocol::ProtocolError;
use foliodb_store::StoreError;
use thiserror::Error;

/// Everything that can go wrong while replicating.
///
/// Errors are cloneable so the latest one can be carried inside a
/// [`crate::ReplicatorStatus`] snapshot and in per-document events.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReplicatorError {
    /// The channel to the remote peer failed. `retryable` distinguishes
    /// transient faults (network loss, unreachable endpoint) from
    /// permanent ones (authentication rejected, protocol violation on
    /// the wire).
    #[error("transport error: {message}")]
    Transport {
        /// Human-readable description of the fault.
        message: String,
        /// Whether retrying the operation may succeed.
        retryable: bool,
    },

    /// The local store, or the target of a local-to-local session, was
    /// closed while the session needed it.
    #[error("store is unavailable")]
    StoreUnavailable,

    /// A conflict resolver declined to produce a resolution.
    #[error("conflict on document {doc_id} was left unresolved")]
    ConflictUnresolved {
        /// Document whose branches remain in conflict.
        doc_id: String,
    },

    /// A conflict resolver panicked or failed internally.
    #[error("conflict resolver failed on document {doc_id}: {message}")]
    ResolverFailure {
        /// Document the resolver was invoked for.
        doc_id: String,
        /// Panic payload or failure description.
        message: String,
    },

    /// A stored checkpoint did not match the current session identity
    /// or could not be decoded.
    #[error("checkpoint rejected: {reason}")]
    BadCheckpoint {
        /// Why the checkpoint was rejected.
        reason: String,
    },

    /// The peer violated the replication protocol.
    #[error("protocol error: {message}")]
    Protocol {
        /// Description of the violation.
        message: String,
    },

    /// A store operation failed for a reason other than the store
    /// being closed.
    #[error("store error: {0}")]
    Store(StoreError),

    /// The session was interrupted by a stop request.
    #[error("operation cancelled by stop request")]
    Cancelled,

    /// An API call arrived while the replicator was in a state that
    /// cannot accept it, e.g. `start` while already running.
    #[error("cannot {operation} while replicator is {activity}")]
    InvalidState {
        /// The rejected operation.
        operation: String,
        /// The activity level at the time of the call.
        activity: String,
    },
}

impl ReplicatorError {
    /// A transport fault worth retrying.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        ReplicatorError::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// A transport fault that will not go away on its own.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        ReplicatorError::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// A protocol violation.
    pub fn protocol(message: impl Into<String>) -> Self {
        ReplicatorError::Protocol {
            message: message.into(),
        }
    }

    /// True when backing off and retrying the failed operation may
    /// succeed. Only transient transport faults qualify; everything
    /// else is either permanent or scoped to a single document.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReplicatorError::Transport {
                retryable: true,
                ..
            }
        )
    }

    /// True when the error ends the session attempt outright, as
    /// opposed to being scoped to one document or worth a retry.
    pub fn is_fatal(&self) -> bool {
        !self.is_retryable() && !self.is_document_scoped()
    }

    /// True when the error concerns one document rather than the
    /// session. Document-scoped errors are reported through document
    /// events and hold the checkpoint back; they never abort the
    /// session.
    pub(crate) fn is_document_scoped(&self) -> bool {
        match self {
            ReplicatorError::ConflictUnresolved { .. } | ReplicatorError::ResolverFailure { .. } => {
                true
            }
            ReplicatorError::Store(inner) => *inner != StoreError::Closed,
            _ => false,
        }
    }
}

impl From<StoreError> for ReplicatorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Closed => ReplicatorError::StoreUnavailable,
            other => ReplicatorError::Store(other),
        }
    }
}

impl From<ProtocolError> for ReplicatorError {
    fn from(err: ProtocolError) -> Self {
        ReplicatorError::Protocol {
            message: err.to_string(),
        }
    }
}

/// Convenience alias used throughout the replicator.
pub type ReplicatorResult<T> = Result<T, ReplicatorError>;
