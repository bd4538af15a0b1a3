//! Checkpoints: durable sequence watermarks that let interrupted
//! sessions resume instead of rescanning.
//!
//! A checkpoint is keyed by a [`SessionIdentity`] derived from the
//! session's shape. Change the shape (stores, direction, document
//! filter, resolver presence) and the key changes with it, so a
//! reconfigured session starts from scratch rather than trusting a
//! watermark computed under different rules.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use foliodb_store::ReplicaStore;

use crate::config::ReplicatorConfig;
use crate::error::{ReplicatorError, ReplicatorResult};

/// Sequence watermarks for one session identity. `local_sequence`
/// bounds what has been pushed, `remote_sequence` what has been
/// pulled; both only ever grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Everything in the local change log up to and including this
    /// sequence has been pushed and confirmed.
    pub local_sequence: u64,
    /// Everything in the remote change log up to and including this
    /// sequence has been pulled and applied.
    pub remote_sequence: u64,
}

/// Digest of the session parameters that make a checkpoint valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionIdentity([u8; 32]);

impl SessionIdentity {
    /// Derive the identity for a configuration. Credentials and retry
    /// tuning deliberately stay out of the digest: they change how a
    /// session runs, not which revisions it has seen.
    pub fn derive(config: &ReplicatorConfig) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"foliodb.session.v1");
        hasher.update(b"\x01store:");
        hasher.update(config.local.store_id().as_bytes());
        hasher.update(b"\x01target:");
        hasher.update(config.target.descriptor().as_bytes());
        hasher.update(b"\x01direction:");
        hasher.update(config.direction.as_str().as_bytes());
        hasher.update(b"\x01filter:");
        match &config.doc_ids {
            Some(ids) => {
                let mut sorted: Vec<&str> = ids.iter().map(String::as_str).collect();
                sorted.sort_unstable();
                sorted.dedup();
                for id in sorted {
                    hasher.update(b"\x02");
                    hasher.update(id.as_bytes());
                }
            }
            None => hasher.update(b"\x00"),
        }
        hasher.update(b"\x01resolver:");
        hasher.update([u8::from(config.resolver.is_some())]);
        SessionIdentity(hasher.finalize().into())
    }

    /// Lowercase hex form, used in metadata keys and envelopes.
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

/// Where checkpoints persist between sessions.
pub trait CheckpointStore: Send + Sync {
    /// Load the checkpoint for an identity, `None` when absent or
    /// previously reset.
    fn load(&self, identity: &SessionIdentity) -> ReplicatorResult<Option<Checkpoint>>;

    /// Persist the checkpoint for an identity.
    fn save(&self, identity: &SessionIdentity, checkpoint: &Checkpoint) -> ReplicatorResult<()>;

    /// Discard any checkpoint for an identity, forcing the next
    /// session to rescan from sequence zero.
    fn reset(&self, identity: &SessionIdentity) -> ReplicatorResult<()>;
}

/// In-memory checkpoint store for tests and throwaway sessions.
#[derive(Clone, Default)]
pub struct MemoryCheckpointStore {
    slots: Arc<Mutex<HashMap<SessionIdentity, Checkpoint>>>,
}

impl MemoryCheckpointStore {
    /// An empty store.
    pub fn new() -> Self {
        MemoryCheckpointStore::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self, identity: &SessionIdentity) -> ReplicatorResult<Option<Checkpoint>> {
        Ok(self.slots.lock().get(identity).copied())
    }

    fn save(&self, identity: &SessionIdentity, checkpoint: &Checkpoint) -> ReplicatorResult<()> {
        self.slots.lock().insert(*identity, *checkpoint);
        Ok(())
    }

    fn reset(&self, identity: &SessionIdentity) -> ReplicatorResult<()> {
        self.slots.lock().remove(identity);
        Ok(())
    }
}

/// Envelope serialized into the local store's metadata space. The
/// identity travels inside the value as well as in the key so a
/// mangled or copied entry is detected rather than trusted.
#[derive(Serialize, Deserialize)]
struct CheckpointEnvelope {
    identity: String,
    checkpoint: Checkpoint,
}

/// Default checkpoint store: persists into the local store's metadata
/// space, so checkpoints survive exactly as long as the data they
/// describe. A reset leaves an empty marker rather than requiring a
/// delete operation from the metadata API.
pub struct LocalMetaCheckpointStore {
    store: Arc<dyn ReplicaStore>,
}

impl LocalMetaCheckpointStore {
    /// Checkpoints backed by `store`'s metadata space.
    pub fn new(store: Arc<dyn ReplicaStore>) -> Self {
        LocalMetaCheckpointStore { store }
    }

    fn key(identity: &SessionIdentity) -> String {
        format!("repl.checkpoint.{}", identity.hex())
    }
}

impl CheckpointStore for LocalMetaCheckpointStore {
    fn load(&self, identity: &SessionIdentity) -> ReplicatorResult<Option<Checkpoint>> {
        let Some(bytes) = self.store.local_meta_get(&Self::key(identity))? else {
            return Ok(None);
        };
        if bytes.is_empty() {
            return Ok(None);
        }
        let envelope: CheckpointEnvelope =
            ciborium::de::from_reader(bytes.as_slice()).map_err(|e| {
                ReplicatorError::BadCheckpoint {
                    reason: format!("undecodable checkpoint: {e}"),
                }
            })?;
        if envelope.identity != identity.hex() {
            return Err(ReplicatorError::BadCheckpoint {
                reason: "stored identity does not match this session".to_string(),
            });
        }
        Ok(Some(envelope.checkpoint))
    }

    fn save(&self, identity: &SessionIdentity, checkpoint: &Checkpoint) -> ReplicatorResult<()> {
        let envelope = CheckpointEnvelope {
            identity: identity.hex(),
            checkpoint: *checkpoint,
        };
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&envelope, &mut bytes).map_err(|e| {
            ReplicatorError::BadCheckpoint {
                reason: format!("unencodable checkpoint: {e}"),
            }
        })?;
        self.store.local_meta_put(&Self::key(identity), &bytes)?;
        Ok(())
    }

    fn reset(&self, identity: &SessionIdentity) -> ReplicatorResult<()> {
        self.store.local_meta_put(&Self::key(identity), &[])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use foliodb_store::MemoryStore;

    use crate::config::{Direction, Endpoint};

    fn config_for(direction: Direction) -> (ReplicatorConfig, Arc<MemoryStore>) {
        let local = Arc::new(MemoryStore::new());
        let target = Arc::new(MemoryStore::new());
        let config = ReplicatorConfig::new(
            local.clone(),
            Arc::new(local.blobs()),
            Endpoint::local(target.clone(), Arc::new(target.blobs())),
            direction,
        );
        (config, local)
    }

    #[test]
    fn identity_depends_on_direction_and_filter() {
        let (push, _store) = config_for(Direction::Push);
        let pull = ReplicatorConfig {
            direction: Direction::Pull,
            ..push.clone()
        };
        assert_ne!(
            SessionIdentity::derive(&push),
            SessionIdentity::derive(&pull)
        );

        let filtered = push.clone().with_doc_ids(vec!["pet-1".to_string()]);
        assert_ne!(
            SessionIdentity::derive(&push),
            SessionIdentity::derive(&filtered)
        );

        // Filter order does not matter.
        let ab = push
            .clone()
            .with_doc_ids(vec!["a".to_string(), "b".to_string()]);
        let ba = push
            .clone()
            .with_doc_ids(vec!["b".to_string(), "a".to_string()]);
        assert_eq!(SessionIdentity::derive(&ab), SessionIdentity::derive(&ba));
    }

    #[test]
    fn local_meta_store_round_trips_and_resets() {
        let (config, local) = config_for(Direction::PushAndPull);
        let identity = SessionIdentity::derive(&config);
        let checkpoints = LocalMetaCheckpointStore::new(local);

        assert_eq!(checkpoints.load(&identity).unwrap(), None);

        let checkpoint = Checkpoint {
            local_sequence: 42,
            remote_sequence: 7,
        };
        checkpoints.save(&identity, &checkpoint).unwrap();
        assert_eq!(checkpoints.load(&identity).unwrap(), Some(checkpoint));

        checkpoints.reset(&identity).unwrap();
        assert_eq!(checkpoints.load(&identity).unwrap(), None);
    }

    #[test]
    fn corrupt_envelope_is_rejected_as_bad_checkpoint() {
        let (config, local) = config_for(Direction::Push);
        let identity = SessionIdentity::derive(&config);
        let key = format!("repl.checkpoint.{}", identity.hex());
        local.local_meta_put(&key, b"not cbor at all").unwrap();

        let checkpoints = LocalMetaCheckpointStore::new(local);
        let err = checkpoints.load(&identity).unwrap_err();
        assert!(matches!(err, ReplicatorError::BadCheckpoint { .. }));
    }

    #[test]
    fn foreign_identity_envelope_is_rejected() {
        let (config, local) = config_for(Direction::Push);
        let identity = SessionIdentity::derive(&config);
        let checkpoints = LocalMetaCheckpointStore::new(local.clone());

        checkpoints
            .save(&identity, &Checkpoint::default())
            .unwrap();

        // Copy the envelope bytes under a different session's key, as
        // if someone cloned metadata between stores.
        let other = ReplicatorConfig {
            direction: Direction::Pull,
            ..config
        };
        let other_identity = SessionIdentity::derive(&other);
        let stored = local
            .local_meta_get(&format!("repl.checkpoint.{}", identity.hex()))
            .unwrap()
            .unwrap();
        local
            .local_meta_put(
                &format!("repl.checkpoint.{}", other_identity.hex()),
                &stored,
            )
            .unwrap();

        let err = checkpoints.load(&other_identity).unwrap_err();
        assert!(matches!(err, ReplicatorError::BadCheckpoint { .. }));
    }

    #[test]
    fn memory_store_is_keyed_by_identity() {
        let (config, _store) = config_for(Direction::Push);
        let identity = SessionIdentity::derive(&config);
        let other = SessionIdentity::derive(&ReplicatorConfig {
            direction: Direction::Pull,
            ..config
        });

        let checkpoints = MemoryCheckpointStore::new();
        checkpoints
            .save(
                &identity,
                &Checkpoint {
                    local_sequence: 3,
                    remote_sequence: 0,
                },
            )
            .unwrap();
        assert!(checkpoints.load(&identity).unwrap().is_some());
        assert!(checkpoints.load(&other).unwrap().is_none());
    }
}
