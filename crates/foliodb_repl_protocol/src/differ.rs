//! Ancestry comparison between two replicas' views of a document.
//!
//! Both sides exchange leaf-first revision histories; the differ decides
//! who is ahead, or that the branches have diverged. The decision is a
//! pure function of the two chains, so both replicas reach the same
//! verdict from the same inputs.

use foliodb_store::RevisionId;

/// Relationship between the local and remote revision chains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffOutcome {
    /// Both sides are at the same revision (or neither has the document).
    UpToDate,
    /// The local chain contains the remote head; nothing to pull.
    LocalAhead,
    /// The remote chain contains the local head; fast-forward pull.
    RemoteAhead,
    /// The chains diverge from a common point (or from nothing at all).
    Conflict {
        /// Deepest shared revision, `None` when the branches share no
        /// history.
        ancestor: Option<RevisionId>,
    },
}

/// Compare two leaf-first revision chains.
///
/// An empty chain means that side does not have the document.
pub fn diff(local: &[RevisionId], remote: &[RevisionId]) -> DiffOutcome {
    match (local.first(), remote.first()) {
        (None, None) => DiffOutcome::UpToDate,
        (None, Some(_)) => DiffOutcome::RemoteAhead,
        (Some(_), None) => DiffOutcome::LocalAhead,
        (Some(local_head), Some(remote_head)) if local_head == remote_head => {
            DiffOutcome::UpToDate
        }
        (Some(local_head), Some(remote_head)) => {
            if remote.contains(local_head) {
                DiffOutcome::RemoteAhead
            } else if local.contains(remote_head) {
                DiffOutcome::LocalAhead
            } else {
                DiffOutcome::Conflict {
                    ancestor: common_ancestor(local, remote),
                }
            }
        }
    }
}

/// Deepest revision present in both chains, walking from the local leaf.
pub fn common_ancestor(local: &[RevisionId], remote: &[RevisionId]) -> Option<RevisionId> {
    local.iter().find(|id| remote.contains(id)).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn chain(len: usize, seed: &[u8]) -> Vec<RevisionId> {
        let mut ids = Vec::with_capacity(len);
        let mut parent: Option<RevisionId> = None;
        for _ in 0..len {
            let id = RevisionId::derive(parent.as_ref(), false, Some(seed));
            parent = Some(id.clone());
            ids.push(id);
        }
        ids.reverse(); // leaf-first
        ids
    }

    fn extend(base: &[RevisionId], seed: &[u8], by: usize) -> Vec<RevisionId> {
        let mut ids: Vec<RevisionId> = base.to_vec();
        for _ in 0..by {
            let head = ids.first().cloned();
            ids.insert(0, RevisionId::derive(head.as_ref(), false, Some(seed)));
        }
        ids
    }

    #[test]
    fn equal_heads_are_up_to_date() {
        let a = chain(3, b"x");
        assert_eq!(diff(&a, &a), DiffOutcome::UpToDate);
        assert_eq!(diff(&[], &[]), DiffOutcome::UpToDate);
    }

    #[test]
    fn missing_side_defers_to_the_other() {
        let a = chain(2, b"x");
        assert_eq!(diff(&[], &a), DiffOutcome::RemoteAhead);
        assert_eq!(diff(&a, &[]), DiffOutcome::LocalAhead);
    }

    #[test]
    fn superset_chain_is_ahead() {
        let base = chain(2, b"x");
        let longer = extend(&base, b"more", 2);
        assert_eq!(diff(&base, &longer), DiffOutcome::RemoteAhead);
        assert_eq!(diff(&longer, &base), DiffOutcome::LocalAhead);
    }

    #[test]
    fn diverged_chains_conflict_with_their_fork_point() {
        let base = chain(2, b"x");
        let ours = extend(&base, b"ours", 1);
        let theirs = extend(&base, b"theirs", 2);
        let expected = base.first().cloned();
        assert_eq!(
            diff(&ours, &theirs),
            DiffOutcome::Conflict {
                ancestor: expected.clone()
            }
        );
        assert_eq!(
            diff(&theirs, &ours),
            DiffOutcome::Conflict { ancestor: expected }
        );
    }

    #[test]
    fn unrelated_chains_conflict_without_an_ancestor() {
        let a = chain(2, b"a");
        let b = chain(2, b"b");
        assert_eq!(diff(&a, &b), DiffOutcome::Conflict { ancestor: None });
    }

    proptest! {
        #[test]
        fn verdicts_are_mirrored(
            base_len in 1usize..4,
            ours_by in 0usize..3,
            theirs_by in 0usize..3,
        ) {
            let base = chain(base_len, b"base");
            let ours = extend(&base, b"ours", ours_by);
            let theirs = extend(&base, b"theirs", theirs_by);
            let forward = diff(&ours, &theirs);
            let backward = diff(&theirs, &ours);
            let mirrored = match forward.clone() {
                DiffOutcome::UpToDate => DiffOutcome::UpToDate,
                DiffOutcome::LocalAhead => DiffOutcome::RemoteAhead,
                DiffOutcome::RemoteAhead => DiffOutcome::LocalAhead,
                DiffOutcome::Conflict { ancestor } => DiffOutcome::Conflict { ancestor },
            };
            prop_assert_eq!(backward, mirrored);
        }

        #[test]
        fn diff_is_deterministic(
            base_len in 1usize..4,
            ours_by in 0usize..3,
            theirs_by in 0usize..3,
        ) {
            let base = chain(base_len, b"base");
            let ours = extend(&base, b"ours", ours_by);
            let theirs = extend(&base, b"theirs", theirs_by);
            prop_assert_eq!(diff(&ours, &theirs), diff(&ours, &theirs));
        }
    }
}
