//! Store trait and the in-memory reference implementation.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use uuid::Uuid;

use crate::blob::{AttachmentRef, AttachmentStore, BlobDigest, MemoryAttachmentStore, NewAttachment};
use crate::change_log::{ChangeCursor, ChangeLog};
use crate::document::{ApplyOutcome, DocTree, Revision};
use crate::error::{StoreError, StoreResult};
use crate::revision::RevisionId;

/// The surface a replicator needs from a document store.
///
/// Implementations must be safe to share across threads; the replicator
/// reads change feeds, grafts revisions, and persists checkpoints from a
/// background session thread while the application keeps writing.
pub trait ReplicaStore: Send + Sync {
    /// Stable identifier of this store instance.
    fn store_id(&self) -> Uuid;

    /// Whether the store is accepting operations.
    fn is_open(&self) -> bool;

    /// Number of documents whose winning revision is not a tombstone.
    fn document_count(&self) -> StoreResult<u64>;

    /// Highest committed sequence number.
    fn last_sequence(&self) -> StoreResult<u64>;

    /// Cursor over changes after `since`, collapsed to the latest entry per
    /// document. `filter` restricts the cursor to the named documents.
    fn changes_since(&self, since: u64, filter: Option<&[String]>) -> StoreResult<ChangeCursor>;

    /// The document's winning revision, or `None` if the document is
    /// missing or deleted.
    fn winning_revision(&self, doc_id: &str) -> StoreResult<Option<Revision>>;

    /// The revision this store advertises for the document: the winner,
    /// or the highest tombstone when every branch is deleted. `None`
    /// only for documents the store has never seen. Replicators compare
    /// against this chain so deletions propagate instead of being
    /// resurrected by stale pushes.
    fn exposed_revision(&self, doc_id: &str) -> StoreResult<Option<Revision>>;

    /// Metadata of one revision.
    fn revision(&self, doc_id: &str, rev_id: &RevisionId) -> StoreResult<Revision>;

    /// A revision's body bytes; `Ok(None)` when the body has been pruned.
    fn revision_body(&self, doc_id: &str, rev_id: &RevisionId) -> StoreResult<Option<Bytes>>;

    /// Revision chain from `rev_id` back to its root, leaf-first.
    fn revision_history(&self, doc_id: &str, rev_id: &RevisionId) -> StoreResult<Vec<RevisionId>>;

    /// Non-deleted leaves of the document's tree, highest first. An empty
    /// result means the document is missing or deleted; more than one
    /// entry means it is conflicted.
    fn live_leaves(&self, doc_id: &str) -> StoreResult<Vec<RevisionId>>;

    /// Graft a replicated revision into the document's tree.
    ///
    /// `history` is leaf-first and must connect to the existing tree (or
    /// reach a generation-1 root). Applying the same revision twice is a
    /// no-op reported as [`ApplyOutcome::AlreadyPresent`].
    fn put_revision(
        &self,
        doc_id: &str,
        history: &[RevisionId],
        deleted: bool,
        body: Option<Bytes>,
        attachments: Vec<AttachmentRef>,
    ) -> StoreResult<ApplyOutcome>;

    /// Settle a conflict between two leaves in one atomic commit: the loser
    /// is tombstoned and, if given, `merged_body` becomes a new child of
    /// the winner. Returns the revision that now represents the document.
    fn resolve_conflict(
        &self,
        doc_id: &str,
        winner: &RevisionId,
        loser: &RevisionId,
        merged_body: Option<Bytes>,
    ) -> StoreResult<RevisionId>;

    /// Retain a revision's body past its time as a leaf. Called for
    /// revisions that have crossed to another replica so later conflict
    /// resolutions still find their merge base.
    fn mark_synced(&self, doc_id: &str, rev_id: &RevisionId) -> StoreResult<()>;

    /// Read a key from the non-replicated metadata namespace.
    fn local_meta_get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Write a key in the non-replicated metadata namespace.
    fn local_meta_put(&self, key: &str, value: &[u8]) -> StoreResult<()>;

    /// Subscribe to committed sequence numbers. Senders are dropped when
    /// the receiver goes away or the store closes.
    fn subscribe_changes(&self) -> mpsc::Receiver<u64>;

    /// Register a hook that runs when the store closes. Hooks registered
    /// after close run immediately.
    fn on_close(&self, hook: Box<dyn FnOnce() + Send>);
}

#[derive(Default)]
struct StoreInner {
    docs: BTreeMap<String, DocTree>,
    log: ChangeLog,
}

struct StoreShared {
    id: Uuid,
    open: Arc<AtomicBool>,
    inner: RwLock<StoreInner>,
    meta: RwLock<BTreeMap<String, Vec<u8>>>,
    watchers: Mutex<Vec<mpsc::Sender<u64>>>,
    close_hooks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    blobs: MemoryAttachmentStore,
}

/// In-memory document store; the reference [`ReplicaStore`] implementation.
///
/// Cloning produces another handle to the same store.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<StoreShared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store with a fresh identity.
    pub fn new() -> Self {
        MemoryStore {
            shared: Arc::new(StoreShared {
                id: Uuid::new_v4(),
                open: Arc::new(AtomicBool::new(true)),
                inner: RwLock::new(StoreInner::default()),
                meta: RwLock::new(BTreeMap::new()),
                watchers: Mutex::new(Vec::new()),
                close_hooks: Mutex::new(Vec::new()),
                blobs: MemoryAttachmentStore::new(),
            }),
        }
    }

    /// Handle to this store's attachment storage.
    pub fn blobs(&self) -> MemoryAttachmentStore {
        self.shared.blobs.clone()
    }

    /// Save a document body, creating the document or extending its
    /// winning branch. Returns the new revision id. Saving a body
    /// identical to the current winner is a no-op.
    pub fn save(&self, doc_id: &str, body: &serde_json::Value) -> StoreResult<RevisionId> {
        self.save_with_attachments(doc_id, body, Vec::new())
    }

    /// Save a document body together with attachment content. Attachment
    /// blobs are stored by digest before the revision commits.
    pub fn save_with_attachments(
        &self,
        doc_id: &str,
        body: &serde_json::Value,
        attachments: Vec<NewAttachment>,
    ) -> StoreResult<RevisionId> {
        self.ensure_open()?;
        let body_bytes = canonical_body(body)?;
        let mut refs = Vec::with_capacity(attachments.len());
        for attachment in attachments {
            let digest = BlobDigest::of(&attachment.data);
            let length = attachment.data.len() as u64;
            self.shared.blobs.write(&digest, attachment.data)?;
            refs.push(AttachmentRef {
                name: attachment.name,
                digest,
                content_type: attachment.content_type,
                length,
            });
        }

        let (id, seq) = {
            let mut inner = self.shared.inner.write();
            self.ensure_open()?;
            let tree = inner.docs.entry(doc_id.to_string()).or_default();
            let parent = tree.exposed().map(|(rev, _)| rev);
            let id =
                tree.insert_child(parent.as_ref(), false, Some(body_bytes), refs, doc_id)?;
            let seq = commit_change(&mut inner, doc_id);
            (id, seq)
        };
        self.emit(seq);
        Ok(id)
    }

    /// Delete a document by appending a tombstone to its exposed branch.
    /// Deleting an already-deleted document still records a change.
    pub fn delete(&self, doc_id: &str) -> StoreResult<RevisionId> {
        let (id, seq) = {
            let mut inner = self.shared.inner.write();
            self.ensure_open()?;
            let tree = inner
                .docs
                .get_mut(doc_id)
                .ok_or_else(|| StoreError::doc_not_found(doc_id))?;
            let parent = tree.exposed().map(|(rev, _)| rev);
            let id = tree.insert_child(parent.as_ref(), true, None, Vec::new(), doc_id)?;
            let seq = commit_change(&mut inner, doc_id);
            (id, seq)
        };
        self.emit(seq);
        Ok(id)
    }

    /// The winning revision's body as JSON, or `None` if the document is
    /// missing or deleted.
    pub fn get(&self, doc_id: &str) -> StoreResult<Option<serde_json::Value>> {
        match self.get_raw(doc_id)? {
            Some((_, bytes)) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| StoreError::corrupt(format!("bad body for {doc_id}: {e}")))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// The winning revision id and raw body bytes.
    pub fn get_raw(&self, doc_id: &str) -> StoreResult<Option<(RevisionId, Bytes)>> {
        let inner = self.shared.inner.read();
        self.ensure_open()?;
        let Some(tree) = inner.docs.get(doc_id) else {
            return Ok(None);
        };
        let Some(winner) = tree.winner() else {
            return Ok(None);
        };
        let body = tree
            .node(&winner)
            .and_then(|node| node.body.clone())
            .ok_or_else(|| StoreError::corrupt(format!("winner of {doc_id} has no body")))?;
        Ok(Some((winner, body)))
    }

    /// Close the store. Idempotent; pending cursors fail, watchers are
    /// dropped, and registered close hooks run exactly once.
    pub fn close(&self) {
        {
            let _guard = self.shared.inner.write();
            if !self.shared.open.swap(false, Ordering::AcqRel) {
                return;
            }
        }
        self.shared.watchers.lock().clear();
        let hooks = std::mem::take(&mut *self.shared.close_hooks.lock());
        for hook in hooks {
            hook();
        }
        tracing::debug!(store = %self.shared.id, "store closed");
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.shared.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::Closed)
        }
    }

    fn emit(&self, seq: u64) {
        self.shared
            .watchers
            .lock()
            .retain(|tx| tx.send(seq).is_ok());
    }
}

/// Append a change entry advertising the document's exposed revision.
fn commit_change(inner: &mut StoreInner, doc_id: &str) -> u64 {
    let exposed = inner
        .docs
        .get(doc_id)
        .and_then(|tree| tree.exposed());
    match exposed {
        Some((rev, deleted)) => inner.log.append(doc_id, rev, deleted),
        None => inner.log.last_sequence(),
    }
}

fn canonical_body(body: &serde_json::Value) -> StoreResult<Bytes> {
    // serde_json maps iterate in key order, so equal values give equal bytes.
    let bytes = serde_json::to_vec(body)
        .map_err(|e| StoreError::corrupt(format!("unencodable body: {e}")))?;
    Ok(Bytes::from(bytes))
}

impl ReplicaStore for MemoryStore {
    fn store_id(&self) -> Uuid {
        self.shared.id
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    fn document_count(&self) -> StoreResult<u64> {
        let inner = self.shared.inner.read();
        self.ensure_open()?;
        Ok(inner
            .docs
            .values()
            .filter(|tree| tree.winner().is_some())
            .count() as u64)
    }

    fn last_sequence(&self) -> StoreResult<u64> {
        let inner = self.shared.inner.read();
        self.ensure_open()?;
        Ok(inner.log.last_sequence())
    }

    fn changes_since(&self, since: u64, filter: Option<&[String]>) -> StoreResult<ChangeCursor> {
        let inner = self.shared.inner.read();
        self.ensure_open()?;
        let allowed: Option<HashSet<String>> =
            filter.map(|ids| ids.iter().cloned().collect());
        let entries = inner.log.snapshot_since(since, allowed.as_ref());
        Ok(ChangeCursor::new(entries, self.shared.open.clone()))
    }

    fn winning_revision(&self, doc_id: &str) -> StoreResult<Option<Revision>> {
        let inner = self.shared.inner.read();
        self.ensure_open()?;
        Ok(inner
            .docs
            .get(doc_id)
            .and_then(|tree| tree.winner().and_then(|id| tree.revision(&id))))
    }

    fn exposed_revision(&self, doc_id: &str) -> StoreResult<Option<Revision>> {
        let inner = self.shared.inner.read();
        self.ensure_open()?;
        Ok(inner.docs.get(doc_id).and_then(|tree| {
            tree.exposed()
                .and_then(|(id, _deleted)| tree.revision(&id))
        }))
    }

    fn revision(&self, doc_id: &str, rev_id: &RevisionId) -> StoreResult<Revision> {
        let inner = self.shared.inner.read();
        self.ensure_open()?;
        inner
            .docs
            .get(doc_id)
            .ok_or_else(|| StoreError::doc_not_found(doc_id))?
            .revision(rev_id)
            .ok_or_else(|| StoreError::rev_not_found(doc_id, rev_id))
    }

    fn revision_body(&self, doc_id: &str, rev_id: &RevisionId) -> StoreResult<Option<Bytes>> {
        let inner = self.shared.inner.read();
        self.ensure_open()?;
        let tree = inner
            .docs
            .get(doc_id)
            .ok_or_else(|| StoreError::doc_not_found(doc_id))?;
        let node = tree
            .node(rev_id)
            .ok_or_else(|| StoreError::rev_not_found(doc_id, rev_id))?;
        Ok(node.body.clone())
    }

    fn revision_history(&self, doc_id: &str, rev_id: &RevisionId) -> StoreResult<Vec<RevisionId>> {
        let inner = self.shared.inner.read();
        self.ensure_open()?;
        inner
            .docs
            .get(doc_id)
            .ok_or_else(|| StoreError::doc_not_found(doc_id))?
            .history(rev_id)
            .ok_or_else(|| StoreError::rev_not_found(doc_id, rev_id))
    }

    fn live_leaves(&self, doc_id: &str) -> StoreResult<Vec<RevisionId>> {
        let inner = self.shared.inner.read();
        self.ensure_open()?;
        Ok(inner
            .docs
            .get(doc_id)
            .map(|tree| tree.live_leaves())
            .unwrap_or_default())
    }

    fn put_revision(
        &self,
        doc_id: &str,
        history: &[RevisionId],
        deleted: bool,
        body: Option<Bytes>,
        attachments: Vec<AttachmentRef>,
    ) -> StoreResult<ApplyOutcome> {
        let (outcome, seq) = {
            let mut inner = self.shared.inner.write();
            self.ensure_open()?;
            let tree = inner.docs.entry(doc_id.to_string()).or_default();
            let outcome = tree.graft(history, deleted, body, attachments, doc_id)?;
            let seq = match outcome {
                ApplyOutcome::AlreadyPresent => None,
                _ => Some(commit_change(&mut inner, doc_id)),
            };
            (outcome, seq)
        };
        if let Some(seq) = seq {
            self.emit(seq);
        }
        Ok(outcome)
    }

    fn resolve_conflict(
        &self,
        doc_id: &str,
        winner: &RevisionId,
        loser: &RevisionId,
        merged_body: Option<Bytes>,
    ) -> StoreResult<RevisionId> {
        let (id, seq) = {
            let mut inner = self.shared.inner.write();
            self.ensure_open()?;
            let tree = inner
                .docs
                .get_mut(doc_id)
                .ok_or_else(|| StoreError::doc_not_found(doc_id))?;
            let id = tree.resolve(winner, loser, merged_body, doc_id)?;
            let seq = commit_change(&mut inner, doc_id);
            (id, seq)
        };
        self.emit(seq);
        tracing::debug!(doc = doc_id, winner = %id, "conflict resolved");
        Ok(id)
    }

    fn mark_synced(&self, doc_id: &str, rev_id: &RevisionId) -> StoreResult<()> {
        let mut inner = self.shared.inner.write();
        self.ensure_open()?;
        let tree = inner
            .docs
            .get_mut(doc_id)
            .ok_or_else(|| StoreError::doc_not_found(doc_id))?;
        let node = tree
            .node_mut(rev_id)
            .ok_or_else(|| StoreError::rev_not_found(doc_id, rev_id))?;
        node.retained = true;
        Ok(())
    }

    fn local_meta_get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let meta = self.shared.meta.read();
        self.ensure_open()?;
        Ok(meta.get(key).cloned())
    }

    fn local_meta_put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        let mut meta = self.shared.meta.write();
        self.ensure_open()?;
        meta.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn subscribe_changes(&self) -> mpsc::Receiver<u64> {
        let (tx, rx) = mpsc::channel();
        self.shared.watchers.lock().push(tx);
        rx
    }

    fn on_close(&self, hook: Box<dyn FnOnce() + Send>) {
        if !self.is_open() {
            hook();
            return;
        }
        self.shared.close_hooks.lock().push(hook);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn save_get_and_count() {
        let store = MemoryStore::new();
        let r1 = store.save("doc1", &json!({"species": "Tiger"})).unwrap();
        assert_eq!(r1.generation(), 1);
        assert_eq!(
            store.get("doc1").unwrap(),
            Some(json!({"species": "Tiger"}))
        );
        assert_eq!(store.document_count().unwrap(), 1);

        let r2 = store
            .save("doc1", &json!({"species": "Tiger", "name": "Hobbes"}))
            .unwrap();
        assert_eq!(r2.generation(), 2);
        assert_eq!(store.document_count().unwrap(), 1);
        assert_eq!(store.last_sequence().unwrap(), 2);
    }

    #[test]
    fn delete_hides_the_document_and_logs_a_change() {
        let store = MemoryStore::new();
        store.save("doc1", &json!({"n": 1})).unwrap();
        store.delete("doc1").unwrap();

        assert_eq!(store.get("doc1").unwrap(), None);
        assert_eq!(store.document_count().unwrap(), 0);
        assert!(store.winning_revision("doc1").unwrap().is_none());
        let exposed = store.exposed_revision("doc1").unwrap().unwrap();
        assert!(exposed.deleted);

        let mut cursor = store.changes_since(0, None).unwrap();
        let entry = cursor.next().unwrap().unwrap();
        assert!(entry.deleted);
        assert_eq!(entry.doc_id, "doc1");

        // Deleting again is allowed and still bumps the sequence.
        let before = store.last_sequence().unwrap();
        store.delete("doc1").unwrap();
        assert_eq!(store.last_sequence().unwrap(), before + 1);

        assert!(matches!(
            store.delete("missing"),
            Err(StoreError::DocumentNotFound { .. })
        ));
    }

    #[test]
    fn independent_stores_converge_on_identical_edits() {
        let a = MemoryStore::new();
        let b = MemoryStore::new();
        let ra = a.save("doc1", &json!({"species": "Tiger"})).unwrap();
        let rb = b.save("doc1", &json!({"species": "Tiger"})).unwrap();
        assert_eq!(ra, rb);
    }

    #[test]
    fn change_cursor_reports_latest_revision_per_document() {
        let store = MemoryStore::new();
        store.save("a", &json!({"v": 1})).unwrap();
        store.save("b", &json!({"v": 1})).unwrap();
        store.save("a", &json!({"v": 2})).unwrap();

        let mut cursor = store.changes_since(0, None).unwrap();
        let first = cursor.next().unwrap().unwrap();
        let second = cursor.next().unwrap().unwrap();
        assert!(cursor.next().unwrap().is_none());
        assert_eq!(first.doc_id, "b");
        assert_eq!(second.doc_id, "a");
        assert_eq!(second.sequence, 3);

        let filter = vec!["a".to_string()];
        let mut cursor = store.changes_since(0, Some(&filter)).unwrap();
        assert_eq!(cursor.next().unwrap().unwrap().doc_id, "a");
        assert!(cursor.next().unwrap().is_none());
    }

    #[test]
    fn put_revision_grafts_and_is_idempotent() {
        let source = MemoryStore::new();
        let r1 = source.save("doc1", &json!({"v": 1})).unwrap();
        let r2 = source.save("doc1", &json!({"v": 2})).unwrap();
        let history = source.revision_history("doc1", &r2).unwrap();
        let body = source.get_raw("doc1").unwrap().unwrap().1;

        let target = MemoryStore::new();
        let outcome = target
            .put_revision("doc1", &history, false, Some(body.clone()), Vec::new())
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(target.get("doc1").unwrap(), Some(json!({"v": 2})));
        assert_eq!(target.revision_history("doc1", &r2).unwrap(), vec![r2.clone(), r1]);

        let seq = target.last_sequence().unwrap();
        let outcome = target
            .put_revision("doc1", &history, false, Some(body), Vec::new())
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::AlreadyPresent);
        assert_eq!(target.last_sequence().unwrap(), seq);
    }

    #[test]
    fn conflicting_graft_then_resolution() {
        let store = MemoryStore::new();
        let r1 = store.save("doc1", &json!({"base": true})).unwrap();
        let r2a = store.save("doc1", &json!({"side": "local"})).unwrap();

        let other = Bytes::from(serde_json::to_vec(&json!({"side": "remote"})).unwrap());
        let r2b = RevisionId::derive(Some(&r1), false, Some(&other));
        let outcome = store
            .put_revision(
                "doc1",
                &[r2b.clone(), r1.clone()],
                false,
                Some(other),
                Vec::new(),
            )
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::ConflictCreated);
        assert_eq!(store.live_leaves("doc1").unwrap().len(), 2);

        let merged = Bytes::from(serde_json::to_vec(&json!({"side": "both"})).unwrap());
        let winner = store
            .resolve_conflict("doc1", &r2a, &r2b, Some(merged))
            .unwrap();
        assert_eq!(store.live_leaves("doc1").unwrap(), vec![winner]);
        assert_eq!(store.get("doc1").unwrap(), Some(json!({"side": "both"})));
    }

    #[test]
    fn mark_synced_retains_bodies_for_later_merges() {
        let store = MemoryStore::new();
        let r1 = store.save("doc1", &json!({"v": 1})).unwrap();
        store.mark_synced("doc1", &r1).unwrap();
        store.save("doc1", &json!({"v": 2})).unwrap();
        assert!(store.revision_body("doc1", &r1).unwrap().is_some());

        let bare = MemoryStore::new();
        let b1 = bare.save("doc1", &json!({"v": 1})).unwrap();
        bare.save("doc1", &json!({"v": 2})).unwrap();
        assert!(bare.revision_body("doc1", &b1).unwrap().is_none());
    }

    #[test]
    fn local_meta_round_trips_and_is_not_a_change() {
        let store = MemoryStore::new();
        store.local_meta_put("checkpoint", b"state").unwrap();
        assert_eq!(
            store.local_meta_get("checkpoint").unwrap(),
            Some(b"state".to_vec())
        );
        assert_eq!(store.local_meta_get("other").unwrap(), None);
        assert_eq!(store.last_sequence().unwrap(), 0);
    }

    #[test]
    fn close_is_idempotent_and_fails_later_operations() {
        let store = MemoryStore::new();
        store.save("doc1", &json!({"v": 1})).unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        store.on_close(Box::new(move || flag.store(true, Ordering::Release)));

        store.close();
        store.close();
        assert!(ran.load(Ordering::Acquire));
        assert!(!store.is_open());
        assert_eq!(store.save("doc1", &json!({"v": 2})), Err(StoreError::Closed));
        assert_eq!(store.get("doc1"), Err(StoreError::Closed));
        assert_eq!(store.local_meta_put("k", b"v"), Err(StoreError::Closed));

        // Hooks registered after close fire immediately.
        let late = Arc::new(AtomicBool::new(false));
        let flag = late.clone();
        store.on_close(Box::new(move || flag.store(true, Ordering::Release)));
        assert!(late.load(Ordering::Acquire));
    }

    #[test]
    fn change_feed_delivers_committed_sequences() {
        let store = MemoryStore::new();
        let feed = store.subscribe_changes();
        store.save("doc1", &json!({"v": 1})).unwrap();
        store.save("doc2", &json!({"v": 1})).unwrap();
        assert_eq!(feed.recv().unwrap(), 1);
        assert_eq!(feed.recv().unwrap(), 2);
    }

    #[test]
    fn attachments_are_stored_by_digest_and_shared() {
        let store = MemoryStore::new();
        store
            .save_with_attachments(
                "doc1",
                &json!({"kind": "profile"}),
                vec![NewAttachment::new("photo", "image/png", &b"pixels"[..])],
            )
            .unwrap();
        store
            .save_with_attachments(
                "doc2",
                &json!({"kind": "profile"}),
                vec![NewAttachment::new("picture", "image/png", &b"pixels"[..])],
            )
            .unwrap();

        assert_eq!(store.blobs().blob_count().unwrap(), 1);
        let rev = store.winning_revision("doc1").unwrap().unwrap();
        assert_eq!(rev.attachments.len(), 1);
        let att = &rev.attachments[0];
        assert_eq!(att.name, "photo");
        assert_eq!(att.content_type, "image/png");
        assert_eq!(att.length, 6);
        assert_eq!(
            store.blobs().read(&att.digest).unwrap(),
            Some(Bytes::from_static(b"pixels"))
        );
    }
}
