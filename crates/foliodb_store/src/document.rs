//! Per-document revision trees.
//!
//! Every document is a tree of revisions. Concurrent edits on different
//! replicas form sibling branches; the winning revision is the highest
//! non-deleted leaf under the total order on [`RevisionId`], so every
//! replica holding the same tree exposes the same winner. Bodies of
//! non-leaf revisions are dropped unless explicitly retained, keeping the
//! tree cheap while histories stay available for ancestry checks.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::blob::AttachmentRef;
use crate::error::{StoreError, StoreResult};
use crate::revision::RevisionId;

/// Result of applying a replicated revision to a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyOutcome {
    /// The revision extended the tree without creating a new branch.
    Applied,
    /// The revision was already known; nothing changed.
    AlreadyPresent,
    /// The revision landed on a new branch, leaving the document conflicted.
    ConflictCreated,
}

/// Metadata for one revision in a document's tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision {
    /// The revision's identifier.
    pub id: RevisionId,
    /// Parent revision, `None` for roots.
    pub parent: Option<RevisionId>,
    /// Whether this revision is a deletion tombstone.
    pub deleted: bool,
    /// Attachments referenced by this revision.
    pub attachments: Vec<AttachmentRef>,
}

/// One node in a revision tree.
#[derive(Debug)]
pub(crate) struct RevNode {
    pub(crate) parent: Option<RevisionId>,
    pub(crate) deleted: bool,
    pub(crate) body: Option<Bytes>,
    pub(crate) attachments: Vec<AttachmentRef>,
    /// Keep the body even after this revision stops being a leaf.
    pub(crate) retained: bool,
    pub(crate) has_child: bool,
}

/// A document's full revision tree.
#[derive(Debug, Default)]
pub(crate) struct DocTree {
    nodes: HashMap<RevisionId, RevNode>,
}

impl DocTree {
    pub(crate) fn contains(&self, id: &RevisionId) -> bool {
        self.nodes.contains_key(id)
    }

    pub(crate) fn node(&self, id: &RevisionId) -> Option<&RevNode> {
        self.nodes.get(id)
    }

    pub(crate) fn node_mut(&mut self, id: &RevisionId) -> Option<&mut RevNode> {
        self.nodes.get_mut(id)
    }

    pub(crate) fn revision(&self, id: &RevisionId) -> Option<Revision> {
        self.nodes.get(id).map(|node| Revision {
            id: id.clone(),
            parent: node.parent.clone(),
            deleted: node.deleted,
            attachments: node.attachments.clone(),
        })
    }

    /// All leaves, highest first.
    pub(crate) fn leaves(&self) -> Vec<RevisionId> {
        let mut out: Vec<RevisionId> = self
            .nodes
            .iter()
            .filter(|(_, node)| !node.has_child)
            .map(|(id, _)| id.clone())
            .collect();
        out.sort_unstable_by(|a, b| b.cmp(a));
        out
    }

    /// Non-deleted leaves, highest first. More than one means the document
    /// is in conflict.
    pub(crate) fn live_leaves(&self) -> Vec<RevisionId> {
        let mut out: Vec<RevisionId> = self
            .nodes
            .iter()
            .filter(|(_, node)| !node.has_child && !node.deleted)
            .map(|(id, _)| id.clone())
            .collect();
        out.sort_unstable_by(|a, b| b.cmp(a));
        out
    }

    /// The winning revision, or `None` if every leaf is a tombstone.
    pub(crate) fn winner(&self) -> Option<RevisionId> {
        self.live_leaves().into_iter().next()
    }

    /// The revision a change entry should advertise: the winner if one
    /// exists, otherwise the highest tombstone (the document is deleted).
    pub(crate) fn exposed(&self) -> Option<(RevisionId, bool)> {
        if let Some(winner) = self.winner() {
            return Some((winner, false));
        }
        self.leaves().into_iter().next().map(|id| (id, true))
    }

    /// Revision chain from `id` back to its root, leaf-first.
    pub(crate) fn history(&self, id: &RevisionId) -> Option<Vec<RevisionId>> {
        self.nodes.get(id)?;
        let mut out = Vec::new();
        let mut cursor = Some(id.clone());
        while let Some(current) = cursor {
            match self.nodes.get(&current) {
                Some(node) => {
                    cursor = node.parent.clone();
                    out.push(current);
                }
                None => break,
            }
        }
        Some(out)
    }

    /// Record a locally authored revision as a child of `parent`.
    ///
    /// The id is derived from the content, so re-saving an identical edit
    /// is a no-op that returns the existing id.
    pub(crate) fn insert_child(
        &mut self,
        parent: Option<&RevisionId>,
        deleted: bool,
        body: Option<Bytes>,
        attachments: Vec<AttachmentRef>,
        doc_id: &str,
    ) -> StoreResult<RevisionId> {
        if let Some(parent) = parent {
            if !self.nodes.contains_key(parent) {
                return Err(StoreError::rev_not_found(doc_id, parent));
            }
        }
        let id = RevisionId::derive(parent, deleted, body.as_deref());
        if self.nodes.contains_key(&id) {
            return Ok(id);
        }
        self.attach(id.clone(), parent.cloned(), deleted, body, attachments, false);
        Ok(id)
    }

    /// Graft a replicated revision and its history into the tree.
    ///
    /// `history` is leaf-first; missing ancestors are inserted as body-less
    /// stubs. A history that shares no revision with a non-empty tree is
    /// only accepted when it reaches back to a generation-1 root, which
    /// creates a parallel branch (a conflict with no common ancestor).
    pub(crate) fn graft(
        &mut self,
        history: &[RevisionId],
        deleted: bool,
        body: Option<Bytes>,
        attachments: Vec<AttachmentRef>,
        doc_id: &str,
    ) -> StoreResult<ApplyOutcome> {
        let leaf = history
            .first()
            .ok_or_else(|| StoreError::invalid_history(doc_id, "empty history"))?;
        for (i, id) in history.iter().enumerate() {
            if leaf.generation().checked_sub(i as u64) != Some(id.generation()) {
                return Err(StoreError::invalid_history(
                    doc_id,
                    "generations must descend by one toward the root",
                ));
            }
        }

        if let Some(node) = self.nodes.get_mut(leaf) {
            // A stub we only knew by id may now receive its body.
            if node.body.is_none() && !node.deleted && body.is_some() {
                node.body = body;
                node.attachments = attachments;
                node.retained = true;
            }
            return Ok(ApplyOutcome::AlreadyPresent);
        }

        let connect = history
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, id)| self.nodes.contains_key(id))
            .map(|(i, _)| i);
        let new_tail = match connect {
            Some(index) => index,
            None => {
                let deepest = &history[history.len() - 1];
                if !self.nodes.is_empty() && deepest.generation() != 1 {
                    return Err(StoreError::invalid_history(
                        doc_id,
                        "history does not connect to any known revision",
                    ));
                }
                history.len()
            }
        };

        // Ancestors first so every parent exists when its child lands.
        for i in (1..new_tail).rev() {
            let parent = history.get(i + 1).cloned();
            self.attach(history[i].clone(), parent, false, None, Vec::new(), false);
        }
        self.attach(
            leaf.clone(),
            history.get(1).cloned(),
            deleted,
            body,
            attachments,
            true,
        );

        if self.live_leaves().len() > 1 {
            Ok(ApplyOutcome::ConflictCreated)
        } else {
            Ok(ApplyOutcome::Applied)
        }
    }

    /// Settle a conflict between two leaves.
    ///
    /// The losing branch is closed with a tombstone. With `merged_body` the
    /// resolution becomes a new child of the winner carrying the winner's
    /// attachment refs; otherwise the winner simply stands. Returns the
    /// revision that now represents the document. Because every derived id
    /// is content-addressed, replicas that apply the same resolution mint
    /// identical tombstone and merge revisions.
    pub(crate) fn resolve(
        &mut self,
        winner: &RevisionId,
        loser: &RevisionId,
        merged_body: Option<Bytes>,
        doc_id: &str,
    ) -> StoreResult<RevisionId> {
        if winner == loser {
            return Err(StoreError::invalid_history(
                doc_id,
                "winner and loser must be distinct revisions",
            ));
        }
        for id in [winner, loser] {
            match self.nodes.get(id) {
                None => return Err(StoreError::rev_not_found(doc_id, id)),
                Some(node) if node.has_child => {
                    return Err(StoreError::invalid_history(
                        doc_id,
                        format!("revision {id} is not a leaf"),
                    ));
                }
                Some(_) => {}
            }
        }

        let tombstone = RevisionId::derive(Some(loser), true, None);
        if !self.nodes.contains_key(&tombstone) {
            self.attach(tombstone, Some(loser.clone()), true, None, Vec::new(), false);
        }

        match merged_body {
            Some(body) => {
                let attachments = self
                    .nodes
                    .get(winner)
                    .map(|node| node.attachments.clone())
                    .unwrap_or_default();
                let merged = RevisionId::derive(Some(winner), false, Some(&body));
                if !self.nodes.contains_key(&merged) {
                    self.attach(
                        merged.clone(),
                        Some(winner.clone()),
                        false,
                        Some(body),
                        attachments,
                        false,
                    );
                }
                Ok(merged)
            }
            None => Ok(winner.clone()),
        }
    }

    fn attach(
        &mut self,
        id: RevisionId,
        parent: Option<RevisionId>,
        deleted: bool,
        body: Option<Bytes>,
        attachments: Vec<AttachmentRef>,
        retained: bool,
    ) {
        if let Some(parent) = parent.as_ref() {
            if let Some(parent_node) = self.nodes.get_mut(parent) {
                parent_node.has_child = true;
                if !parent_node.retained {
                    parent_node.body = None;
                }
            }
        }
        self.nodes.insert(
            id,
            RevNode {
                parent,
                deleted,
                body,
                attachments,
                retained,
                has_child: false,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(text: &str) -> Option<Bytes> {
        Some(Bytes::copy_from_slice(text.as_bytes()))
    }

    fn save(tree: &mut DocTree, parent: Option<&RevisionId>, text: &str) -> RevisionId {
        tree.insert_child(parent, false, body(text), Vec::new(), "doc")
            .unwrap()
    }

    #[test]
    fn linear_edits_keep_a_single_leaf() {
        let mut tree = DocTree::default();
        let r1 = save(&mut tree, None, "one");
        let r2 = save(&mut tree, Some(&r1), "two");
        assert_eq!(tree.winner(), Some(r2.clone()));
        assert_eq!(tree.leaves(), vec![r2.clone()]);
        assert_eq!(tree.history(&r2).unwrap(), vec![r2, r1]);
    }

    #[test]
    fn parent_body_is_pruned_unless_retained() {
        let mut tree = DocTree::default();
        let r1 = save(&mut tree, None, "one");
        save(&mut tree, Some(&r1), "two");
        assert!(tree.node(&r1).unwrap().body.is_none());

        let mut tree = DocTree::default();
        let r1 = save(&mut tree, None, "one");
        tree.node_mut(&r1).unwrap().retained = true;
        save(&mut tree, Some(&r1), "two");
        assert_eq!(tree.node(&r1).unwrap().body, body("one"));
    }

    #[test]
    fn identical_edit_is_a_no_op() {
        let mut tree = DocTree::default();
        let r1 = save(&mut tree, None, "same");
        let again = save(&mut tree, None, "same");
        assert_eq!(r1, again);
        assert_eq!(tree.leaves().len(), 1);
    }

    #[test]
    fn graft_builds_a_new_document() {
        let r1 = RevisionId::derive(None, false, Some(b"a"));
        let r2 = RevisionId::derive(Some(&r1), false, Some(b"b"));
        let mut tree = DocTree::default();
        let outcome = tree
            .graft(&[r2.clone(), r1.clone()], false, body("b"), Vec::new(), "doc")
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(tree.winner(), Some(r2.clone()));
        // The missing ancestor landed as a body-less stub.
        assert!(tree.node(&r1).unwrap().body.is_none());
        assert_eq!(tree.history(&r2).unwrap(), vec![r2, r1]);
    }

    #[test]
    fn graft_extends_an_existing_branch() {
        let mut tree = DocTree::default();
        let r1 = save(&mut tree, None, "one");
        let r2 = RevisionId::derive(Some(&r1), false, Some(b"two"));
        let outcome = tree
            .graft(&[r2.clone(), r1.clone()], false, body("two"), Vec::new(), "doc")
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(tree.winner(), Some(r2));
        assert_eq!(tree.live_leaves().len(), 1);
    }

    #[test]
    fn graft_of_a_known_revision_reports_already_present() {
        let mut tree = DocTree::default();
        let r1 = save(&mut tree, None, "one");
        let outcome = tree
            .graft(&[r1.clone()], false, body("one"), Vec::new(), "doc")
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::AlreadyPresent);
        assert_eq!(tree.leaves(), vec![r1]);
    }

    #[test]
    fn graft_fills_the_body_of_a_stub() {
        let r1 = RevisionId::derive(None, false, Some(b"a"));
        let r2 = RevisionId::derive(Some(&r1), false, Some(b"b"));
        let mut tree = DocTree::default();
        tree.graft(&[r2, r1.clone()], false, body("b"), Vec::new(), "doc")
            .unwrap();
        assert!(tree.node(&r1).unwrap().body.is_none());

        let outcome = tree
            .graft(&[r1.clone()], false, body("a"), Vec::new(), "doc")
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::AlreadyPresent);
        assert_eq!(tree.node(&r1).unwrap().body, body("a"));
        assert!(tree.node(&r1).unwrap().retained);
    }

    #[test]
    fn divergent_branches_create_a_conflict() {
        let mut tree = DocTree::default();
        let r1 = save(&mut tree, None, "base");
        let r2a = save(&mut tree, Some(&r1), "ours");
        let r2b = RevisionId::derive(Some(&r1), false, Some(b"theirs"));
        let outcome = tree
            .graft(
                &[r2b.clone(), r1.clone()],
                false,
                body("theirs"),
                Vec::new(),
                "doc",
            )
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::ConflictCreated);
        let mut live = tree.live_leaves();
        live.sort();
        let mut expected = vec![r2a, r2b];
        expected.sort();
        assert_eq!(live, expected);
    }

    #[test]
    fn unrelated_root_history_becomes_a_parallel_branch() {
        let mut tree = DocTree::default();
        save(&mut tree, None, "local root");
        let foreign = RevisionId::derive(None, false, Some(b"foreign root"));
        let outcome = tree
            .graft(&[foreign.clone()], false, body("foreign root"), Vec::new(), "doc")
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::ConflictCreated);
        assert_eq!(tree.live_leaves().len(), 2);
    }

    #[test]
    fn disconnected_non_root_history_is_rejected() {
        let mut tree = DocTree::default();
        save(&mut tree, None, "local");
        let foreign_r1 = RevisionId::derive(None, false, Some(b"f1"));
        let foreign_r2 = RevisionId::derive(Some(&foreign_r1), false, Some(b"f2"));
        // History truncated before its root and sharing nothing with the tree.
        let err = tree
            .graft(&[foreign_r2], false, body("f2"), Vec::new(), "doc")
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidHistory { .. }));
    }

    #[test]
    fn graft_validates_generation_descent() {
        let r1 = RevisionId::derive(None, false, Some(b"a"));
        let r3 = {
            let r2 = RevisionId::derive(Some(&r1), false, Some(b"b"));
            RevisionId::derive(Some(&r2), false, Some(b"c"))
        };
        let mut tree = DocTree::default();
        // r3 directly on r1 skips a generation.
        let err = tree
            .graft(&[r3, r1], false, body("c"), Vec::new(), "doc")
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidHistory { .. }));
    }

    #[test]
    fn winner_is_the_highest_live_leaf() {
        let mut tree = DocTree::default();
        let r1 = save(&mut tree, None, "base");
        let r2a = save(&mut tree, Some(&r1), "a");
        let r2b = RevisionId::derive(Some(&r1), false, Some(b"b"));
        tree.graft(&[r2b.clone(), r1], false, body("b"), Vec::new(), "doc")
            .unwrap();
        let expected = r2a.max(r2b);
        assert_eq!(tree.winner(), Some(expected));
    }

    #[test]
    fn deleting_the_only_leaf_removes_the_winner() {
        let mut tree = DocTree::default();
        let r1 = save(&mut tree, None, "x");
        let tomb = tree
            .insert_child(Some(&r1), true, None, Vec::new(), "doc")
            .unwrap();
        assert_eq!(tree.winner(), None);
        assert_eq!(tree.exposed(), Some((tomb, true)));
    }

    #[test]
    fn resolve_tombstones_the_loser() {
        let mut tree = DocTree::default();
        let r1 = save(&mut tree, None, "base");
        let r2a = save(&mut tree, Some(&r1), "ours");
        let r2b = RevisionId::derive(Some(&r1), false, Some(b"theirs"));
        tree.graft(&[r2b.clone(), r1], false, body("theirs"), Vec::new(), "doc")
            .unwrap();

        let kept = tree.resolve(&r2a, &r2b, None, "doc").unwrap();
        assert_eq!(kept, r2a);
        assert_eq!(tree.live_leaves(), vec![r2a.clone()]);
        assert_eq!(tree.winner(), Some(r2a));
    }

    #[test]
    fn resolve_with_merge_creates_a_child_of_the_winner() {
        let mut tree = DocTree::default();
        let r1 = save(&mut tree, None, "base");
        let r2a = save(&mut tree, Some(&r1), "ours");
        let r2b = RevisionId::derive(Some(&r1), false, Some(b"theirs"));
        tree.graft(&[r2b.clone(), r1], false, body("theirs"), Vec::new(), "doc")
            .unwrap();

        let merged = tree.resolve(&r2a, &r2b, body("merged"), "doc").unwrap();
        assert_eq!(merged.generation(), 3);
        assert_eq!(tree.live_leaves(), vec![merged.clone()]);
        assert_eq!(tree.node(&merged).unwrap().body, body("merged"));

        // The settled winner is no longer a leaf, so re-resolving is refused.
        let again = tree.resolve(&r2a, &r2b, body("merged"), "doc");
        assert!(matches!(again, Err(StoreError::InvalidHistory { .. })));
    }

    #[test]
    fn resolve_rejects_non_leaves_and_unknown_revisions() {
        let mut tree = DocTree::default();
        let r1 = save(&mut tree, None, "base");
        let r2 = save(&mut tree, Some(&r1), "next");
        let stranger = RevisionId::derive(None, false, Some(b"stranger"));

        assert!(matches!(
            tree.resolve(&r2, &r1, None, "doc"),
            Err(StoreError::InvalidHistory { .. })
        ));
        assert!(matches!(
            tree.resolve(&r2, &stranger, None, "doc"),
            Err(StoreError::RevisionNotFound { .. })
        ));
    }
}
