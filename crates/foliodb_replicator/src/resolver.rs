//! Conflict resolution policies.
//!
//! When a pulled revision lands on a different branch than the local
//! edits, the document has two live leaves and somebody has to pick a
//! survivor. Resolution always runs on the active (pulling) side; the
//! passive side stores both branches untouched. Because revision ids
//! are derived from content, two replicas running the same resolver
//! over the same branches mint identical tombstones and merge
//! revisions, so resolution itself converges.

use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};

use serde_json::{Map, Value};
use thiserror::Error;

use foliodb_store::RevisionId;

use crate::error::ReplicatorError;

/// One side of a conflict as presented to a resolver.
#[derive(Debug, Clone)]
pub struct RevisionView {
    /// The branch's leaf revision.
    pub rev_id: RevisionId,
    /// Whether this leaf is a tombstone.
    pub deleted: bool,
    /// Decoded body, `None` for tombstones and pruned revisions.
    pub body: Option<Value>,
}

/// Everything a resolver gets to look at: both branches plus their
/// closest common ancestor, when one exists. Documents created
/// independently on each replica have no common ancestor.
#[derive(Debug, Clone)]
pub struct ConflictBodies {
    /// The conflicted document.
    pub doc_id: String,
    /// The branch grown locally.
    pub local: RevisionView,
    /// The branch that arrived by replication.
    pub remote: RevisionView,
    /// Closest shared revision of the two branches, if any.
    pub ancestor: Option<RevisionView>,
}

/// What a resolver decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Keep the local branch; tombstone the remote one.
    UseLocal,
    /// Keep the remote branch; tombstone the local one.
    UseRemote,
    /// Tombstone the losing branch and commit this body as a new child
    /// of the winning one.
    Merged(Value),
}

/// A resolver's refusal to decide. The conflict stays in the tree and
/// is reported as a document-level error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ResolveError(pub String);

/// Policy for settling a two-branch conflict.
///
/// Implementations must be deterministic in the conflict contents:
/// replicas that see the same branches must reach the same resolution
/// or their stores will diverge.
pub trait ConflictResolver: Send + Sync {
    /// Decide which branch survives, or produce a merged body.
    fn resolve(&self, conflict: &ConflictBodies) -> Result<Resolution, ResolveError>;
}

/// Default policy: the branch with the higher revision id wins. The id
/// ordering (generation, then digest) is a total order shared by all
/// replicas, so both sides of a sync pick the same survivor without
/// coordinating.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultResolver;

impl ConflictResolver for DefaultResolver {
    fn resolve(&self, conflict: &ConflictBodies) -> Result<Resolution, ResolveError> {
        if conflict.local.rev_id >= conflict.remote.rev_id {
            Ok(Resolution::UseLocal)
        } else {
            Ok(Resolution::UseRemote)
        }
    }
}

/// Field-level merge policy.
///
/// With a common ancestor this is a three-way merge over top-level
/// fields: a field changed on one side only takes that side's value, a
/// field removed against an unchanged base stays removed, and when
/// both sides changed the same field the branch with the higher
/// revision id supplies the value. Without an ancestor the same rules
/// degrade to a field union with the higher branch winning
/// disagreements. A tombstone never survives against a concurrent
/// edit.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeResolver;

impl ConflictResolver for MergeResolver {
    fn resolve(&self, conflict: &ConflictBodies) -> Result<Resolution, ResolveError> {
        match (conflict.local.deleted, conflict.remote.deleted) {
            (true, true) => return DefaultResolver.resolve(conflict),
            (true, false) => return Ok(Resolution::UseRemote),
            (false, true) => return Ok(Resolution::UseLocal),
            (false, false) => {}
        }

        let local = object_body(&conflict.local, &conflict.doc_id)?;
        let remote = object_body(&conflict.remote, &conflict.doc_id)?;
        let base = conflict
            .ancestor
            .as_ref()
            .and_then(|a| a.body.as_ref())
            .and_then(Value::as_object);

        let (winner, loser) = if conflict.local.rev_id >= conflict.remote.rev_id {
            (local, remote)
        } else {
            (remote, local)
        };
        Ok(Resolution::Merged(Value::Object(merge_fields(
            base, winner, loser,
        ))))
    }
}

fn object_body<'a>(view: &'a RevisionView, doc_id: &str) -> Result<&'a Map<String, Value>, ResolveError> {
    view.body
        .as_ref()
        .and_then(Value::as_object)
        .ok_or_else(|| ResolveError(format!("cannot merge {doc_id}: branch body is not an object")))
}

fn merge_fields(
    base: Option<&Map<String, Value>>,
    winner: &Map<String, Value>,
    loser: &Map<String, Value>,
) -> Map<String, Value> {
    let mut keys: BTreeSet<&String> = winner.keys().chain(loser.keys()).collect();
    if let Some(base) = base {
        keys.extend(base.keys());
    }

    let mut out = Map::new();
    for key in keys {
        let w = winner.get(key);
        let l = loser.get(key);
        let b = base.and_then(|m| m.get(key));
        let merged = match (w, l) {
            (Some(wv), Some(lv)) if wv == lv => Some(wv),
            (Some(wv), Some(lv)) => match b {
                // Only one side moved away from the base; keep the move.
                Some(bv) if bv == wv => Some(lv),
                Some(bv) if bv == lv => Some(wv),
                _ => Some(wv),
            },
            (Some(wv), None) => match b {
                // The loser removed a field the winner left untouched.
                Some(bv) if bv == wv => None,
                _ => Some(wv),
            },
            (None, Some(lv)) => match b {
                Some(bv) if bv == lv => None,
                _ => Some(lv),
            },
            (None, None) => None,
        };
        if let Some(value) = merged {
            out.insert(key.clone(), value.clone());
        }
    }
    out
}

/// Invoke a resolver, translating refusals and panics into replication
/// errors. A panicking resolver must not take the session down.
pub(crate) fn run_resolver(
    resolver: &dyn ConflictResolver,
    conflict: &ConflictBodies,
) -> Result<Resolution, ReplicatorError> {
    match catch_unwind(AssertUnwindSafe(|| resolver.resolve(conflict))) {
        Ok(Ok(resolution)) => Ok(resolution),
        Ok(Err(refusal)) => {
            tracing::debug!(doc = %conflict.doc_id, reason = %refusal, "resolver declined");
            Err(ReplicatorError::ConflictUnresolved {
                doc_id: conflict.doc_id.clone(),
            })
        }
        Err(panic) => {
            let message = panic_message(&panic);
            tracing::warn!(doc = %conflict.doc_id, message, "conflict resolver panicked");
            Err(ReplicatorError::ResolverFailure {
                doc_id: conflict.doc_id.clone(),
                message,
            })
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "resolver panicked".to_string()
    }
}
