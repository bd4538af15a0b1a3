//! The passive side of a replication session.
//!
//! A [`Responder`] answers protocol requests against one store. It
//! stores whatever branches the active side sends and reports
//! conflicts it can see, but it never resolves them; resolution is the
//! active side's job. This is what keeps push and pull symmetric: the
//! same responder code serves both, and a future network listener only
//! has to frame messages and hand them here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use foliodb_repl_protocol::{
    diff, ApplyRequest, ApplyResponse, ApplyResult, BlobCheckRequest, BlobCheckResponse,
    BlobGetRequest, BlobGetResponse, BlobPutRequest, BlobPutResponse, ChangesRequest,
    ChangesResponse, DiffOutcome, ErrorResponse, FetchRequest, FetchResponse, Hello, HelloAck,
    Message, ProposeRequest, ProposeResponse, ProposalVerdict, ProtocolError, TransferUnit,
    Verdict, PROTOCOL_VERSION,
};
use foliodb_store::{ApplyOutcome, AttachmentStore, ReplicaStore, RevisionId, StoreError};

use crate::error::{ReplicatorError, ReplicatorResult};

struct ResponderShared {
    store: Arc<dyn ReplicaStore>,
    blobs: Arc<dyn AttachmentStore>,
    /// Revisions newly applied through this responder. Used by tests to
    /// prove that resumed sessions do not redeliver.
    applied: AtomicU64,
}

/// Serves protocol requests against one store. Cloning shares the
/// underlying store handles and counters.
#[derive(Clone)]
pub struct Responder {
    shared: Arc<ResponderShared>,
}

impl Responder {
    /// A responder over the given store and its attachment storage.
    pub fn new(store: Arc<dyn ReplicaStore>, blobs: Arc<dyn AttachmentStore>) -> Self {
        Responder {
            shared: Arc::new(ResponderShared {
                store,
                blobs,
                applied: AtomicU64::new(0),
            }),
        }
    }

    /// Number of revisions applied (not counting redeliveries of
    /// revisions already present).
    pub fn applied_count(&self) -> u64 {
        self.shared.applied.load(Ordering::Acquire)
    }

    /// Answer one request. Failures become protocol `Error` replies
    /// carrying the retryability verdict, never a dropped connection.
    pub fn handle(&self, request: Message) -> Message {
        let kind = request.kind();
        let result = match request {
            Message::Hello(hello) => self.hello(hello),
            Message::Changes(request) => self.changes(request),
            Message::Propose(request) => self.propose(request),
            Message::Fetch(request) => self.fetch(request),
            Message::Apply(request) => self.apply(request),
            Message::BlobCheck(request) => self.blob_check(request),
            Message::BlobGet(request) => self.blob_get(request),
            Message::BlobPut(request) => self.blob_put(request),
            other => Err(ReplicatorError::protocol(format!(
                "unexpected request {}",
                other.kind()
            ))),
        };
        match result {
            Ok(reply) => reply,
            Err(error) => {
                tracing::debug!(request = kind, error = %error, "request failed");
                Message::Error(ErrorResponse {
                    message: error.to_string(),
                    retryable: error.is_retryable(),
                })
            }
        }
    }

    fn hello(&self, hello: Hello) -> ReplicatorResult<Message> {
        if hello.protocol_version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: hello.protocol_version,
            }
            .into());
        }
        tracing::debug!(peer = %hello.store_id, "handshake accepted");
        Ok(Message::HelloAck(HelloAck {
            protocol_version: PROTOCOL_VERSION,
            store_id: self.shared.store.store_id(),
            last_sequence: self.shared.store.last_sequence()?,
        }))
    }

    fn changes(&self, request: ChangesRequest) -> ReplicatorResult<Message> {
        let limit = request.limit.max(1) as usize;
        let mut cursor = self
            .shared
            .store
            .changes_since(request.since, request.doc_ids.as_deref())?;

        let mut entries = Vec::new();
        let mut has_more = false;
        while let Some(entry) = cursor.next()? {
            if entries.len() >= limit {
                has_more = true;
                break;
            }
            entries.push(entry);
        }
        Ok(Message::ChangesAck(ChangesResponse {
            entries,
            last_sequence: self.shared.store.last_sequence()?,
            has_more,
        }))
    }

    fn propose(&self, request: ProposeRequest) -> ReplicatorResult<Message> {
        let mut verdicts = Vec::with_capacity(request.proposals.len());
        for proposal in request.proposals {
            let verdict = if self.has_revision(&proposal.doc_id, &proposal.rev_id)? {
                Verdict::NotNeeded
            } else {
                let exposed = self.shared.store.exposed_revision(&proposal.doc_id)?;
                let own_chain = match &exposed {
                    Some(revision) => self
                        .shared
                        .store
                        .revision_history(&proposal.doc_id, &revision.id)?,
                    None => Vec::new(),
                };
                match diff(&own_chain, &proposal.history) {
                    DiffOutcome::UpToDate | DiffOutcome::LocalAhead => Verdict::NotNeeded,
                    DiffOutcome::RemoteAhead => Verdict::Send,
                    DiffOutcome::Conflict { .. } => match &exposed {
                        // A branch offered against a deleted document
                        // is accepted; the winner rule prefers live
                        // leaves, so this is how resurrections and
                        // settled conflicts land.
                        Some(revision) if revision.deleted => Verdict::Send,
                        Some(revision) => Verdict::Conflict {
                            rev_id: revision.id.clone(),
                            history: own_chain,
                        },
                        // Unconnected chains on a document this store
                        // has never seen: take the branch and let the
                        // active side resolve.
                        None => Verdict::Send,
                    },
                }
            };
            verdicts.push(ProposalVerdict {
                doc_id: proposal.doc_id,
                verdict,
            });
        }
        Ok(Message::ProposeAck(ProposeResponse { verdicts }))
    }

    fn fetch(&self, request: FetchRequest) -> ReplicatorResult<Message> {
        let mut units = Vec::new();
        let mut missing = Vec::new();
        for want in request.wants {
            let rev_id = match &want.rev_id {
                Some(rev_id) => Some(rev_id.clone()),
                None => self
                    .shared
                    .store
                    .exposed_revision(&want.doc_id)?
                    .map(|rev| rev.id),
            };
            let Some(rev_id) = rev_id else {
                missing.push(want.doc_id);
                continue;
            };
            match self.build_unit(&want.doc_id, &rev_id) {
                Ok(unit) => units.push(unit),
                Err(ReplicatorError::Store(
                    StoreError::DocumentNotFound { .. } | StoreError::RevisionNotFound { .. },
                )) => missing.push(want.doc_id),
                Err(other) => return Err(other),
            }
        }
        Ok(Message::FetchAck(FetchResponse { units, missing }))
    }

    fn build_unit(&self, doc_id: &str, rev_id: &RevisionId) -> ReplicatorResult<TransferUnit> {
        let store = &self.shared.store;
        let revision = store.revision(doc_id, rev_id)?;
        let history = store.revision_history(doc_id, rev_id)?;
        let body = store.revision_body(doc_id, rev_id)?;
        Ok(TransferUnit {
            doc_id: doc_id.to_string(),
            rev_id: rev_id.clone(),
            history,
            deleted: revision.deleted,
            body: body.map(|b| b.to_vec()),
            attachments: revision.attachments,
        })
    }

    fn apply(&self, request: ApplyRequest) -> ReplicatorResult<Message> {
        let mut results = Vec::with_capacity(request.units.len());
        for unit in request.units {
            let doc_id = unit.doc_id.clone();
            match self.apply_unit(unit) {
                Ok(outcome) => {
                    if outcome != ApplyOutcome::AlreadyPresent {
                        self.shared.applied.fetch_add(1, Ordering::AcqRel);
                    }
                    results.push(ApplyResult {
                        doc_id,
                        outcome: Some(outcome),
                        error: None,
                    });
                }
                // A closed store fails the whole request; anything else
                // stays scoped to the one document.
                Err(ReplicatorError::StoreUnavailable) => {
                    return Err(ReplicatorError::StoreUnavailable)
                }
                Err(error) => {
                    tracing::debug!(doc = %doc_id, error = %error, "apply rejected");
                    results.push(ApplyResult {
                        doc_id,
                        outcome: None,
                        error: Some(error.to_string()),
                    });
                }
            }
        }
        Ok(Message::ApplyAck(ApplyResponse { results }))
    }

    fn apply_unit(&self, unit: TransferUnit) -> ReplicatorResult<ApplyOutcome> {
        unit.validate().map_err(|e| {
            ReplicatorError::Store(StoreError::invalid_history(&unit.doc_id, e.to_string()))
        })?;
        for attachment in &unit.attachments {
            if !self.shared.blobs.contains(&attachment.digest)? {
                return Err(ReplicatorError::Store(StoreError::corrupt(format!(
                    "attachment blob {} for {} not uploaded",
                    attachment.digest, unit.doc_id
                ))));
            }
        }
        let outcome = self.shared.store.put_revision(
            &unit.doc_id,
            &unit.history,
            unit.deleted,
            unit.body.map(Bytes::from),
            unit.attachments,
        )?;
        Ok(outcome)
    }

    fn blob_check(&self, request: BlobCheckRequest) -> ReplicatorResult<Message> {
        let mut missing = Vec::new();
        for digest in request.digests {
            if !self.shared.blobs.contains(&digest)? {
                missing.push(digest);
            }
        }
        Ok(Message::BlobCheckAck(BlobCheckResponse { missing }))
    }

    fn blob_get(&self, request: BlobGetRequest) -> ReplicatorResult<Message> {
        let content = self.shared.blobs.read(&request.digest)?;
        Ok(Message::BlobGetAck(BlobGetResponse {
            digest: request.digest,
            content: content.map(|b| b.to_vec()),
        }))
    }

    fn blob_put(&self, request: BlobPutRequest) -> ReplicatorResult<Message> {
        let already_present = self.shared.blobs.contains(&request.digest)?;
        if !already_present {
            self.shared
                .blobs
                .write(&request.digest, Bytes::from(request.content))?;
        }
        Ok(Message::BlobPutAck(BlobPutResponse { already_present }))
    }

    fn has_revision(&self, doc_id: &str, rev_id: &RevisionId) -> ReplicatorResult<bool> {
        match self.shared.store.revision(doc_id, rev_id) {
            Ok(_) => Ok(true),
            Err(StoreError::DocumentNotFound { .. } | StoreError::RevisionNotFound { .. }) => {
                Ok(false)
            }
            Err(other) => Err(other.into()),
        }
    }
}
