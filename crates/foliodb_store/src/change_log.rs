//! Monotonic change log and cursors over it.
//!
//! Every committed write bumps a store-wide sequence and appends an entry
//! advertising the document's current exposed revision. Replication reads
//! the log through [`ChangeCursor`], which collapses multiple changes to
//! one document into the latest entry only.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{StoreError, StoreResult};
use crate::revision::RevisionId;

/// One committed change, in store-wide sequence order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEntry {
    /// Store-wide sequence number of the commit.
    pub sequence: u64,
    /// The document that changed.
    pub doc_id: String,
    /// The document's exposed revision after the commit.
    pub rev_id: RevisionId,
    /// Whether the document is deleted as of this change.
    pub deleted: bool,
}

/// Append-only log of committed changes.
#[derive(Debug, Default)]
pub(crate) struct ChangeLog {
    entries: Vec<ChangeEntry>,
    last_sequence: u64,
}

impl ChangeLog {
    pub(crate) fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub(crate) fn append(&mut self, doc_id: &str, rev_id: RevisionId, deleted: bool) -> u64 {
        self.last_sequence += 1;
        self.entries.push(ChangeEntry {
            sequence: self.last_sequence,
            doc_id: doc_id.to_string(),
            rev_id,
            deleted,
        });
        self.last_sequence
    }

    /// Entries after `since`, collapsed to the latest entry per document
    /// and ordered by sequence. `filter` restricts output to the named
    /// documents.
    pub(crate) fn snapshot_since(
        &self,
        since: u64,
        filter: Option<&HashSet<String>>,
    ) -> Vec<ChangeEntry> {
        let mut latest: BTreeMap<&str, &ChangeEntry> = BTreeMap::new();
        for entry in &self.entries {
            if entry.sequence <= since {
                continue;
            }
            if let Some(allowed) = filter {
                if !allowed.contains(&entry.doc_id) {
                    continue;
                }
            }
            latest.insert(entry.doc_id.as_str(), entry);
        }
        let mut out: Vec<ChangeEntry> = latest.into_values().cloned().collect();
        out.sort_unstable_by_key(|entry| entry.sequence);
        out
    }
}

/// Iterator over a snapshot of the change log.
///
/// The cursor stays usable while its store stays open; once the store is
/// closed, `next` reports [`StoreError::Closed`] even mid-iteration.
#[derive(Debug)]
pub struct ChangeCursor {
    pending: VecDeque<ChangeEntry>,
    open: Arc<AtomicBool>,
}

impl ChangeCursor {
    /// Build a cursor over already-snapshotted entries. `open` is the
    /// owning store's liveness flag.
    pub fn new(entries: Vec<ChangeEntry>, open: Arc<AtomicBool>) -> Self {
        ChangeCursor {
            pending: entries.into(),
            open,
        }
    }

    /// The next change, `Ok(None)` when the snapshot is exhausted.
    pub fn next(&mut self) -> StoreResult<Option<ChangeEntry>> {
        if !self.open.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(self.pending.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revision::RevisionId;

    fn rev(marker: &[u8]) -> RevisionId {
        RevisionId::derive(None, false, Some(marker))
    }

    fn open_flag() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(true))
    }

    #[test]
    fn snapshot_collapses_to_latest_entry_per_document() {
        let mut log = ChangeLog::default();
        log.append("a", rev(b"a1"), false);
        log.append("b", rev(b"b1"), false);
        let latest_a = rev(b"a2");
        log.append("a", latest_a.clone(), false);

        let entries = log.snapshot_since(0, None);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].doc_id, "b");
        assert_eq!(entries[1].doc_id, "a");
        assert_eq!(entries[1].rev_id, latest_a);
        assert_eq!(entries[1].sequence, 3);
    }

    #[test]
    fn snapshot_honors_since_and_filter() {
        let mut log = ChangeLog::default();
        log.append("a", rev(b"a1"), false);
        log.append("b", rev(b"b1"), false);
        log.append("c", rev(b"c1"), true);

        let entries = log.snapshot_since(1, None);
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.sequence > 1));

        let allowed: HashSet<String> = ["c".to_string()].into();
        let entries = log.snapshot_since(0, Some(&allowed));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].doc_id, "c");
        assert!(entries[0].deleted);
    }

    #[test]
    fn cursor_drains_then_reports_none() {
        let mut log = ChangeLog::default();
        log.append("a", rev(b"a1"), false);
        let mut cursor = ChangeCursor::new(log.snapshot_since(0, None), open_flag());
        assert!(cursor.next().unwrap().is_some());
        assert!(cursor.next().unwrap().is_none());
        assert!(cursor.next().unwrap().is_none());
    }

    #[test]
    fn cursor_fails_once_the_store_closes() {
        let mut log = ChangeLog::default();
        log.append("a", rev(b"a1"), false);
        log.append("b", rev(b"b1"), false);
        let open = open_flag();
        let mut cursor = ChangeCursor::new(log.snapshot_since(0, None), open.clone());
        assert!(cursor.next().unwrap().is_some());

        open.store(false, Ordering::Release);
        assert_eq!(cursor.next(), Err(StoreError::Closed));
    }
}
