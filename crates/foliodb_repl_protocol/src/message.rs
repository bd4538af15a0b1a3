//! Wire messages exchanged by the two sides of a replication session.
//!
//! The active side drives every exchange: it sends a request and the
//! passive side answers with the matching response. Messages are encoded
//! as CBOR; revision ids and blob digests travel in their text forms so
//! traces stay readable.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use foliodb_store::{ApplyOutcome, BlobDigest, ChangeEntry, RevisionId};

use crate::error::{ProtocolError, ProtocolResult};
use crate::transfer::TransferUnit;

/// Version of the replication protocol spoken by this crate.
pub const PROTOCOL_VERSION: u16 = 1;

/// Username and password presented during the handshake.
///
/// The in-process transport does not enforce them; network transports
/// validate before the session is admitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Account name.
    pub username: String,
    /// Account secret.
    pub password: String,
}

/// Session opener sent by the active side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Protocol version the sender speaks.
    pub protocol_version: u16,
    /// Identity of the sender's store.
    pub store_id: Uuid,
    /// Optional credentials for the transport to validate.
    pub credentials: Option<Credentials>,
}

/// Handshake acknowledgement from the passive side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloAck {
    /// Protocol version the responder speaks.
    pub protocol_version: u16,
    /// Identity of the responder's store.
    pub store_id: Uuid,
    /// Responder's highest committed sequence, for logging and progress.
    pub last_sequence: u64,
}

/// Ask the passive side for changes after a sequence watermark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesRequest {
    /// Return changes with sequence strictly greater than this.
    pub since: u64,
    /// Maximum number of entries to return.
    pub limit: u32,
    /// Restrict to these documents, when present.
    pub doc_ids: Option<Vec<String>>,
}

/// One batch of the passive side's change log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesResponse {
    /// Latest change per document, ordered by sequence.
    pub entries: Vec<ChangeEntry>,
    /// The responder's highest committed sequence when the snapshot was
    /// taken. When `has_more` is false the watermark may advance all
    /// the way here; entries between the last batch entry and this
    /// bound were filtered out or superseded.
    pub last_sequence: u64,
    /// Whether more matching changes were pending beyond `limit`.
    pub has_more: bool,
}

/// One revision the active side offers to push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    /// Document being offered.
    pub doc_id: String,
    /// Revision being offered.
    pub rev_id: RevisionId,
    /// Leaf-first history of the offered revision.
    pub history: Vec<RevisionId>,
}

/// The passive side's answer to one [`Proposal`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    /// The responder already has this revision or something newer.
    NotNeeded,
    /// The responder wants the revision; send a transfer unit.
    Send,
    /// The responder holds a sibling branch; the offer would conflict.
    Conflict {
        /// The responder's current winning revision.
        rev_id: RevisionId,
        /// Leaf-first history of the responder's winner.
        history: Vec<RevisionId>,
    },
}

/// Verdict for one proposed document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalVerdict {
    /// Document the verdict is for.
    pub doc_id: String,
    /// What the responder wants done.
    pub verdict: Verdict,
}

/// Offer a batch of revisions for push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposeRequest {
    /// Revisions the active side would like to send.
    pub proposals: Vec<Proposal>,
}

/// Verdicts for a batch of proposals, in request order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposeResponse {
    /// One verdict per proposal.
    pub verdicts: Vec<ProposalVerdict>,
}

/// A revision the active side wants to fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Want {
    /// Document to fetch from.
    pub doc_id: String,
    /// Specific revision, or `None` for the responder's current winner.
    pub rev_id: Option<RevisionId>,
}

/// Fetch full transfer units for a set of wants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    /// Revisions to fetch.
    pub wants: Vec<Want>,
}

/// Transfer units answering a [`FetchRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchResponse {
    /// Units for the wants that could be served.
    pub units: Vec<TransferUnit>,
    /// Documents that could not be served (unknown doc or revision).
    pub missing: Vec<String>,
}

/// Deliver transfer units for the passive side to graft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyRequest {
    /// Units to apply, each committed independently.
    pub units: Vec<TransferUnit>,
}

/// Outcome of applying one transfer unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResult {
    /// Document the unit belonged to.
    pub doc_id: String,
    /// Outcome when the unit was applied.
    pub outcome: Option<ApplyOutcome>,
    /// Failure description when it was not.
    pub error: Option<String>,
}

/// Per-unit outcomes for an [`ApplyRequest`], in request order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResponse {
    /// One result per delivered unit.
    pub results: Vec<ApplyResult>,
}

/// Ask which of these blobs the passive side is missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobCheckRequest {
    /// Digests about to be referenced by pushed revisions.
    pub digests: Vec<BlobDigest>,
}

/// Digests the passive side does not hold yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobCheckResponse {
    /// Subset of the checked digests that must be uploaded.
    pub missing: Vec<BlobDigest>,
}

/// Fetch one blob's content by digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobGetRequest {
    /// Digest of the wanted blob.
    pub digest: BlobDigest,
}

/// A blob's content, or `None` when the responder does not hold it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobGetResponse {
    /// Digest the content belongs to.
    pub digest: BlobDigest,
    /// The content, absent when the blob is not stored.
    #[serde(with = "serde_bytes")]
    pub content: Option<Vec<u8>>,
}

/// Upload one blob ahead of the revisions referencing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobPutRequest {
    /// Digest the content must hash to.
    pub digest: BlobDigest,
    /// The content.
    #[serde(with = "serde_bytes")]
    pub content: Vec<u8>,
}

/// Acknowledge a blob upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobPutResponse {
    /// Whether the responder already held this blob.
    pub already_present: bool,
}

/// Failure reply to any request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human-readable failure description.
    pub message: String,
    /// Whether retrying the request might succeed.
    pub retryable: bool,
}

/// Every message that can cross the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Session opener.
    Hello(Hello),
    /// Handshake acknowledgement.
    HelloAck(HelloAck),
    /// Change-feed request.
    Changes(ChangesRequest),
    /// Change-feed batch.
    ChangesAck(ChangesResponse),
    /// Push offer.
    Propose(ProposeRequest),
    /// Push verdicts.
    ProposeAck(ProposeResponse),
    /// Revision fetch.
    Fetch(FetchRequest),
    /// Fetched units.
    FetchAck(FetchResponse),
    /// Revision delivery.
    Apply(ApplyRequest),
    /// Per-unit apply outcomes.
    ApplyAck(ApplyResponse),
    /// Blob presence check.
    BlobCheck(BlobCheckRequest),
    /// Missing digests.
    BlobCheckAck(BlobCheckResponse),
    /// Blob download.
    BlobGet(BlobGetRequest),
    /// Blob content.
    BlobGetAck(BlobGetResponse),
    /// Blob upload.
    BlobPut(BlobPutRequest),
    /// Upload acknowledgement.
    BlobPutAck(BlobPutResponse),
    /// Failure reply.
    Error(ErrorResponse),
}

impl Message {
    /// Short name of the message kind, for logs and mismatch errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello(_) => "Hello",
            Message::HelloAck(_) => "HelloAck",
            Message::Changes(_) => "Changes",
            Message::ChangesAck(_) => "ChangesAck",
            Message::Propose(_) => "Propose",
            Message::ProposeAck(_) => "ProposeAck",
            Message::Fetch(_) => "Fetch",
            Message::FetchAck(_) => "FetchAck",
            Message::Apply(_) => "Apply",
            Message::ApplyAck(_) => "ApplyAck",
            Message::BlobCheck(_) => "BlobCheck",
            Message::BlobCheckAck(_) => "BlobCheckAck",
            Message::BlobGet(_) => "BlobGet",
            Message::BlobGetAck(_) => "BlobGetAck",
            Message::BlobPut(_) => "BlobPut",
            Message::BlobPutAck(_) => "BlobPutAck",
            Message::Error(_) => "Error",
        }
    }
}

/// Encode a message to CBOR bytes.
pub fn encode(message: &Message) -> ProtocolResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(message, &mut buf).map_err(|e| ProtocolError::Encode {
        reason: e.to_string(),
    })?;
    Ok(buf)
}

/// Decode a message from CBOR bytes.
pub fn decode(bytes: &[u8]) -> ProtocolResult<Message> {
    ciborium::de::from_reader(bytes).map_err(|e: ciborium::de::Error<std::io::Error>| {
        ProtocolError::Decode {
            reason: e.to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: Message) -> Message {
        let bytes = encode(&message).unwrap();
        decode(&bytes).unwrap()
    }

    #[test]
    fn handshake_round_trips() {
        let hello = Message::Hello(Hello {
            protocol_version: PROTOCOL_VERSION,
            store_id: Uuid::new_v4(),
            credentials: Some(Credentials {
                username: "sync".to_string(),
                password: "secret".to_string(),
            }),
        });
        assert_eq!(round_trip(hello.clone()), hello);
    }

    #[test]
    fn changes_batch_round_trips() {
        let rev = RevisionId::derive(None, false, Some(b"x"));
        let message = Message::ChangesAck(ChangesResponse {
            entries: vec![ChangeEntry {
                sequence: 7,
                doc_id: "doc1".to_string(),
                rev_id: rev,
                deleted: false,
            }],
            last_sequence: 7,
            has_more: true,
        });
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn transfer_unit_with_body_and_attachments_round_trips() {
        let r1 = RevisionId::derive(None, false, Some(b"v1"));
        let r2 = RevisionId::derive(Some(&r1), false, Some(b"v2"));
        let digest = BlobDigest::of(b"blob");
        let message = Message::Apply(ApplyRequest {
            units: vec![TransferUnit {
                doc_id: "doc1".to_string(),
                rev_id: r2.clone(),
                history: vec![r2, r1],
                deleted: false,
                body: Some(b"{\"v\":2}".to_vec()),
                attachments: vec![foliodb_store::AttachmentRef {
                    name: "photo".to_string(),
                    digest,
                    content_type: "image/png".to_string(),
                    length: 4,
                }],
            }],
        });
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn conflict_verdict_round_trips() {
        let rev = RevisionId::derive(None, false, Some(b"theirs"));
        let message = Message::ProposeAck(ProposeResponse {
            verdicts: vec![ProposalVerdict {
                doc_id: "doc1".to_string(),
                verdict: Verdict::Conflict {
                    rev_id: rev.clone(),
                    history: vec![rev],
                },
            }],
        });
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn blob_content_round_trips_including_absent() {
        let digest = BlobDigest::of(b"payload");
        let full = Message::BlobGetAck(BlobGetResponse {
            digest,
            content: Some(b"payload".to_vec()),
        });
        assert_eq!(round_trip(full.clone()), full);

        let empty = Message::BlobGetAck(BlobGetResponse {
            digest,
            content: None,
        });
        assert_eq!(round_trip(empty.clone()), empty);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            decode(b"not cbor at all"),
            Err(ProtocolError::Decode { .. })
        ));
    }

    #[test]
    fn kind_names_every_variant() {
        let message = Message::Error(ErrorResponse {
            message: "boom".to_string(),
            retryable: true,
        });
        assert_eq!(message.kind(), "Error");
    }
}
