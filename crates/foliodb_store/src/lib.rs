//! # FolioDB Store
//!
//! Document storage for FolioDB replicas:
//!
//! - Documents as revision trees with content-derived revision ids, so
//!   replicas merge histories without coordination
//! - Deterministic winning-revision selection across replicas
//! - A monotonic change log with filterable cursors for replication
//! - Content-addressed attachment storage with digest-based dedup
//! - A non-replicated metadata namespace for checkpoints and similar state
//!
//! [`MemoryStore`] is the in-memory reference implementation of the
//! [`ReplicaStore`] trait the replicator drives.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod blob;
mod change_log;
mod document;
mod error;
mod revision;
mod store;

pub use blob::{
    AttachmentRef, AttachmentStore, BlobDigest, MemoryAttachmentStore, NewAttachment,
};
pub use change_log::{ChangeCursor, ChangeEntry};
pub use document::{ApplyOutcome, Revision};
pub use error::{StoreError, StoreResult};
pub use revision::RevisionId;
pub use store::{MemoryStore, ReplicaStore};
