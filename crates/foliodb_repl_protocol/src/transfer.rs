//! The unit of document transfer.

use serde::{Deserialize, Serialize};

use foliodb_store::{AttachmentRef, RevisionId};

use crate::error::{ProtocolError, ProtocolResult};

/// One revision in flight between replicas.
///
/// Carries everything the receiving store needs to graft the revision:
/// the leaf-first history chain for connecting to the local tree, the
/// body bytes, and attachment references. Attachment content travels
/// separately, negotiated by digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferUnit {
    /// Document the revision belongs to.
    pub doc_id: String,
    /// The revision being transferred.
    pub rev_id: RevisionId,
    /// Revision chain from `rev_id` back toward the root, leaf-first.
    pub history: Vec<RevisionId>,
    /// Whether the revision is a deletion tombstone.
    pub deleted: bool,
    /// Canonical body bytes; `None` for tombstones and pruned revisions.
    #[serde(with = "serde_bytes")]
    pub body: Option<Vec<u8>>,
    /// Attachments referenced by the revision.
    pub attachments: Vec<AttachmentRef>,
}

impl TransferUnit {
    /// Check internal consistency before applying the unit.
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.history.first() != Some(&self.rev_id) {
            return Err(ProtocolError::MalformedUnit {
                doc_id: self.doc_id.clone(),
                reason: "history must start at the transferred revision".to_string(),
            });
        }
        if self.deleted && self.body.is_some() {
            return Err(ProtocolError::MalformedUnit {
                doc_id: self.doc_id.clone(),
                reason: "tombstones carry no body".to_string(),
            });
        }
        Ok(())
    }
}
