//! Content-derived revision identifiers.
//!
//! A revision id is `{generation}-{digest}` where the digest is derived from
//! the parent revision id, the deletion flag, and the canonical body bytes.
//! Two replicas that apply the same edit to the same parent therefore mint
//! the same revision id, and the trees stay mergeable without coordination.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;

/// Digest length kept in a revision id, in bytes.
const DIGEST_LEN: usize = 16;

/// Identifier of a single revision in a document's revision tree.
///
/// Ordered by `(generation, digest)`, which gives every set of sibling
/// revisions a deterministic total order. The highest non-deleted leaf under
/// this order is the document's winning revision on every replica.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct RevisionId {
    generation: u64,
    digest: [u8; DIGEST_LEN],
}

impl RevisionId {
    /// Derive the id for a new revision.
    ///
    /// The digest covers the parent id (if any), the deletion flag, and the
    /// body bytes, so identical edits on different replicas converge on the
    /// same id.
    pub fn derive(parent: Option<&RevisionId>, deleted: bool, body: Option<&[u8]>) -> Self {
        let mut hasher = Sha256::new();
        if let Some(parent) = parent {
            hasher.update(parent.to_string().as_bytes());
        }
        hasher.update([u8::from(deleted)]);
        if let Some(body) = body {
            hasher.update(body);
        }
        let full = hasher.finalize();
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&full[..DIGEST_LEN]);
        RevisionId {
            generation: parent.map_or(1, |p| p.generation + 1),
            digest,
        }
    }

    /// Depth of this revision in its tree; roots have generation 1.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, hex::encode(self.digest))
    }
}

impl FromStr for RevisionId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (gen_part, digest_part) = s.split_once('-').ok_or_else(|| {
            StoreError::InvalidRevisionId {
                reason: format!("missing '-' separator in {s:?}"),
            }
        })?;
        let generation: u64 =
            gen_part
                .parse()
                .map_err(|_| StoreError::InvalidRevisionId {
                    reason: format!("bad generation in {s:?}"),
                })?;
        if generation == 0 {
            return Err(StoreError::InvalidRevisionId {
                reason: "generation must be at least 1".to_string(),
            });
        }
        let raw = hex::decode(digest_part).map_err(|_| StoreError::InvalidRevisionId {
            reason: format!("bad digest hex in {s:?}"),
        })?;
        if raw.len() != DIGEST_LEN {
            return Err(StoreError::InvalidRevisionId {
                reason: format!("digest must be {DIGEST_LEN} bytes, got {}", raw.len()),
            });
        }
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&raw);
        Ok(RevisionId { generation, digest })
    }
}

impl From<RevisionId> for String {
    fn from(id: RevisionId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for RevisionId {
    type Error = StoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn derivation_is_deterministic() {
        let a = RevisionId::derive(None, false, Some(b"{\"n\":1}"));
        let b = RevisionId::derive(None, false, Some(b"{\"n\":1}"));
        assert_eq!(a, b);
        assert_eq!(a.generation(), 1);
    }

    #[test]
    fn different_inputs_give_different_ids() {
        let root = RevisionId::derive(None, false, Some(b"{\"n\":1}"));
        let other_body = RevisionId::derive(None, false, Some(b"{\"n\":2}"));
        let tombstone = RevisionId::derive(None, true, None);
        assert_ne!(root, other_body);
        assert_ne!(root, tombstone);

        let child = RevisionId::derive(Some(&root), false, Some(b"{\"n\":1}"));
        assert_eq!(child.generation(), 2);
        assert_ne!(child, root);
    }

    #[test]
    fn same_edit_on_both_replicas_converges() {
        let root_a = RevisionId::derive(None, false, Some(b"{\"species\":\"Tiger\"}"));
        let root_b = RevisionId::derive(None, false, Some(b"{\"species\":\"Tiger\"}"));
        assert_eq!(root_a, root_b);

        let child_a = RevisionId::derive(Some(&root_a), false, Some(b"{\"species\":\"Cat\"}"));
        let child_b = RevisionId::derive(Some(&root_b), false, Some(b"{\"species\":\"Cat\"}"));
        assert_eq!(child_a, child_b);
    }

    #[test]
    fn ordering_prefers_generation_then_digest() {
        let root = RevisionId::derive(None, false, Some(b"x"));
        let child = RevisionId::derive(Some(&root), false, Some(b"y"));
        assert!(child > root);

        let sibling_a = RevisionId::derive(Some(&root), false, Some(b"a"));
        let sibling_b = RevisionId::derive(Some(&root), false, Some(b"b"));
        assert_eq!(sibling_a.generation(), sibling_b.generation());
        assert_ne!(sibling_a.cmp(&sibling_b), std::cmp::Ordering::Equal);
        // Total order is stable regardless of comparison direction.
        assert_eq!(
            sibling_a.cmp(&sibling_b),
            sibling_b.cmp(&sibling_a).reverse()
        );
    }

    #[test]
    fn display_and_parse_round_trip() {
        let id = RevisionId::derive(None, false, Some(b"body"));
        let text = id.to_string();
        assert!(text.starts_with("1-"));
        let parsed: RevisionId = text.parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn parse_rejects_malformed_ids() {
        assert!("nodash".parse::<RevisionId>().is_err());
        assert!("x-abcd".parse::<RevisionId>().is_err());
        assert!("0-00000000000000000000000000000000"
            .parse::<RevisionId>()
            .is_err());
        assert!("1-zz".parse::<RevisionId>().is_err());
        assert!("1-abcd".parse::<RevisionId>().is_err()); // digest too short
    }

    proptest! {
        #[test]
        fn any_derived_id_survives_text_round_trip(
            body in proptest::collection::vec(any::<u8>(), 0..64),
            deleted in any::<bool>(),
            depth in 0usize..4,
        ) {
            let mut id = RevisionId::derive(None, false, Some(&body));
            for _ in 0..depth {
                id = RevisionId::derive(Some(&id), deleted, Some(&body));
            }
            let parsed: RevisionId = id.to_string().parse().unwrap();
            prop_assert_eq!(parsed, id);
        }
    }
}
