//! The data plane of one replication session.
//!
//! A [`Pipeline`] owns the channel for the duration of a connection and
//! drives pull and push passes over it. Each pass works in batches:
//! poll the peer's change log (pull) or the local one (push), skip what
//! the other side already has, transfer the rest, and advance the
//! checkpoint past everything contiguously confirmed. Conflicts are
//! settled on this side, the active side, so the passive peer never
//! needs a resolver.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use foliodb_repl_protocol::{
    common_ancestor, ApplyRequest, BlobCheckRequest, BlobGetRequest, BlobPutRequest,
    ChangesRequest, ChangesResponse, FetchRequest, Hello, HelloAck, Message, Proposal,
    ProposeRequest, ProtocolError, TransferUnit, Verdict, Want, PROTOCOL_VERSION,
};
use foliodb_store::{
    ApplyOutcome, AttachmentStore, BlobDigest, ChangeEntry, ReplicaStore, RevisionId, StoreError,
};

use crate::checkpoint::{Checkpoint, CheckpointStore, SessionIdentity};
use crate::error::{ReplicatorError, ReplicatorResult};
use crate::replicator::{DocumentEvent, Inner};
use crate::resolver::{run_resolver, ConflictBodies, Resolution, RevisionView};
use crate::transport::Channel;

/// Open the session: present our store id and credentials, check the
/// protocol version the peer answers with.
pub(crate) fn handshake(
    channel: &mut dyn Channel,
    config: &crate::config::ReplicatorConfig,
) -> ReplicatorResult<HelloAck> {
    let reply = channel.request(&Message::Hello(Hello {
        protocol_version: PROTOCOL_VERSION,
        store_id: config.local.store_id(),
        credentials: config.credentials.clone(),
    }))?;
    match reply {
        Message::HelloAck(ack) => {
            if ack.protocol_version != PROTOCOL_VERSION {
                return Err(ProtocolError::VersionMismatch {
                    local: PROTOCOL_VERSION,
                    remote: ack.protocol_version,
                }
                .into());
            }
            tracing::debug!(
                peer = %ack.store_id,
                peer_sequence = ack.last_sequence,
                "handshake complete"
            );
            Ok(ack)
        }
        other => Err(unexpected("HelloAck", other.kind())),
    }
}

fn unexpected(expected: &'static str, got: &'static str) -> ReplicatorError {
    ProtocolError::UnexpectedMessage { expected, got }.into()
}

/// One local change waiting to be pushed, with its revision chain.
struct PushCandidate {
    entry: ChangeEntry,
    history: Vec<RevisionId>,
}

/// A push the peer refused because its document has diverged.
struct PushConflict {
    doc_id: String,
    remote_rev: RevisionId,
    sequence: u64,
}

#[derive(Default)]
struct PullOutcome {
    /// Revisions newly applied locally.
    pulled: u64,
    /// Entries fully dealt with, including skips.
    completed: u64,
    /// Sequences of entries that failed with a document-scoped error.
    failed: Vec<u64>,
}

#[derive(Default)]
struct PushOutcome {
    pushed: u64,
    completed: u64,
    failed: Vec<u64>,
    conflicts: Vec<PushConflict>,
}

/// Drives batches over an established channel until both sides agree.
pub(crate) struct Pipeline<'a> {
    inner: &'a Inner,
    channel: Box<dyn Channel>,
    checkpoint: Checkpoint,
    identity: SessionIdentity,
    /// Highest local sequence this session has already considered.
    /// Guards the idle probe against re-waking for work that failed
    /// and is waiting for the next session or a newer change.
    seen_local: u64,
    /// Same, for the peer's change log.
    seen_remote: u64,
}

impl<'a> Pipeline<'a> {
    pub(crate) fn new(
        inner: &'a Inner,
        channel: Box<dyn Channel>,
        checkpoint: Checkpoint,
        identity: SessionIdentity,
    ) -> Self {
        Pipeline {
            inner,
            channel,
            checkpoint,
            identity,
            seen_local: checkpoint.local_sequence,
            seen_remote: checkpoint.remote_sequence,
        }
    }

    /// Run pull then push until neither side has pending changes.
    /// Returns the number of revisions that crossed the wire.
    pub(crate) fn run_cycle(&mut self) -> ReplicatorResult<u64> {
        let mut moved = 0;
        if self.inner.config.direction.wants_pull() {
            moved += self.pull_pass()?;
        }
        if self.inner.config.direction.wants_push() {
            moved += self.push_pass()?;
        }
        Ok(moved)
    }

    /// Cheap check used between idle polls: is there anything newer
    /// than what this session has already seen?
    pub(crate) fn probe_pending(&mut self) -> ReplicatorResult<bool> {
        if self.inner.config.direction.wants_pull() {
            let ack = self.request_changes(self.checkpoint.remote_sequence, 1)?;
            if !ack.entries.is_empty() && ack.last_sequence > self.seen_remote {
                return Ok(true);
            }
        }
        if self.inner.config.direction.wants_push() {
            let config = &self.inner.config;
            let mut cursor = config
                .local
                .changes_since(self.checkpoint.local_sequence, config.doc_ids.as_deref())?;
            while let Some(entry) = cursor.next()? {
                if entry.sequence > self.seen_local {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn request(&mut self, message: &Message) -> ReplicatorResult<Message> {
        self.channel.request(message)
    }

    fn request_changes(&mut self, since: u64, limit: u32) -> ReplicatorResult<ChangesResponse> {
        let reply = self.request(&Message::Changes(ChangesRequest {
            since,
            limit,
            doc_ids: self.inner.config.doc_ids.clone(),
        }))?;
        match reply {
            Message::ChangesAck(ack) => Ok(ack),
            other => Err(unexpected("ChangesAck", other.kind())),
        }
    }

    fn save_checkpoint(&self) -> ReplicatorResult<()> {
        self.inner.checkpoints.save(&self.identity, &self.checkpoint)
    }

    /// Retry `attempt_fn` on transient failures, backing off between
    /// attempts. Non-retryable errors and exhausted budgets propagate.
    fn with_retry<T>(
        &mut self,
        operation: &'static str,
        attempt_fn: impl Fn(&mut Self) -> ReplicatorResult<T>,
    ) -> ReplicatorResult<T> {
        let retry = self.inner.config.retry;
        let mut attempt = 1u32;
        loop {
            match attempt_fn(self) {
                Ok(value) => return Ok(value),
                Err(error) if error.is_retryable() && attempt < retry.max_attempts => {
                    let delay = retry.delay_for_attempt(attempt);
                    tracing::warn!(
                        operation,
                        attempt,
                        error = %error,
                        delay_ms = delay.as_millis() as u64,
                        "transient failure, backing off"
                    );
                    self.inner.sleep_cancellable(delay)?;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    fn has_local_revision(&self, doc_id: &str, rev_id: &RevisionId) -> ReplicatorResult<bool> {
        match self.inner.config.local.revision(doc_id, rev_id) {
            Ok(_) => Ok(true),
            Err(StoreError::DocumentNotFound { .. } | StoreError::RevisionNotFound { .. }) => {
                Ok(false)
            }
            Err(other) => Err(other.into()),
        }
    }

    // ---- pull ----

    fn pull_pass(&mut self) -> ReplicatorResult<u64> {
        let mut moved = 0u64;
        loop {
            self.inner.check_interrupt()?;
            let since = self.checkpoint.remote_sequence;
            let limit = self.inner.config.batch_size;
            let ack = self.with_retry("poll changes", |p| p.request_changes(since, limit))?;
            self.seen_remote = self.seen_remote.max(ack.last_sequence);

            if ack.entries.is_empty() {
                // Anything between the watermark and the peer's bound
                // was filtered out or superseded.
                if !ack.has_more && ack.last_sequence > self.checkpoint.remote_sequence {
                    self.checkpoint.remote_sequence = ack.last_sequence;
                    self.save_checkpoint()?;
                }
                break;
            }
            self.inner.note_busy();
            self.inner.add_progress(ack.entries.len() as u64, 0);

            let outcome = self.with_retry("pull batch", |p| p.pull_batch(&ack.entries))?;
            moved += outcome.pulled;
            self.inner.add_progress(0, outcome.completed);

            let batch_bound = ack.entries.last().map(|e| e.sequence).unwrap_or(since);
            let advance_to = match outcome.failed.iter().min() {
                // Hold the watermark just below the first failure so
                // the next session re-presents it.
                Some(first_failed) => first_failed.saturating_sub(1),
                None if ack.has_more => batch_bound,
                None => ack.last_sequence,
            };
            if advance_to > self.checkpoint.remote_sequence {
                self.checkpoint.remote_sequence = advance_to;
                self.save_checkpoint()?;
            }
            if !outcome.failed.is_empty() || !ack.has_more {
                break;
            }
        }
        Ok(moved)
    }

    fn pull_batch(&mut self, entries: &[ChangeEntry]) -> ReplicatorResult<PullOutcome> {
        let mut outcome = PullOutcome::default();
        let sequence_of: HashMap<&str, u64> = entries
            .iter()
            .map(|entry| (entry.doc_id.as_str(), entry.sequence))
            .collect();

        let mut wants = Vec::new();
        for entry in entries {
            if self.has_local_revision(&entry.doc_id, &entry.rev_id)? {
                // Seen in an earlier attempt or session. An interrupted
                // resolution may still have left branches behind.
                match self.resolve_conflicts(&entry.doc_id, Some(&entry.rev_id)) {
                    Ok(()) => outcome.completed += 1,
                    Err(error) if error.is_document_scoped() => {
                        tracing::warn!(doc = %entry.doc_id, %error, "pull failed for document");
                        outcome.failed.push(entry.sequence);
                        self.inner.post_document_event(DocumentEvent {
                            doc_id: entry.doc_id.clone(),
                            pushing: false,
                            deleted: entry.deleted,
                            error: Some(error),
                        });
                    }
                    Err(error) => return Err(error),
                }
                continue;
            }
            wants.push(Want {
                doc_id: entry.doc_id.clone(),
                rev_id: Some(entry.rev_id.clone()),
            });
        }
        if wants.is_empty() {
            return Ok(outcome);
        }

        let reply = self.request(&Message::Fetch(FetchRequest { wants }))?;
        let ack = match reply {
            Message::FetchAck(ack) => ack,
            other => return Err(unexpected("FetchAck", other.kind())),
        };

        // Entries the peer can no longer serve were superseded after
        // the snapshot; the newer revision re-presents on its own.
        if !ack.missing.is_empty() {
            tracing::debug!(count = ack.missing.len(), "peer dropped requested revisions");
            outcome.completed += ack.missing.len() as u64;
        }

        for unit in &ack.units {
            match self.apply_pulled(unit) {
                Ok(applied) => {
                    outcome.completed += 1;
                    if applied {
                        outcome.pulled += 1;
                        self.inner.post_document_event(DocumentEvent {
                            doc_id: unit.doc_id.clone(),
                            pushing: false,
                            deleted: unit.deleted,
                            error: None,
                        });
                    }
                }
                Err(error) if error.is_document_scoped() => {
                    let sequence = sequence_of.get(unit.doc_id.as_str()).copied().unwrap_or(0);
                    tracing::warn!(doc = %unit.doc_id, %error, "pull failed for document");
                    outcome.failed.push(sequence);
                    self.inner.post_document_event(DocumentEvent {
                        doc_id: unit.doc_id.clone(),
                        pushing: false,
                        deleted: unit.deleted,
                        error: Some(error),
                    });
                }
                Err(error) => return Err(error),
            }
        }
        Ok(outcome)
    }

    /// Graft one fetched unit into the local tree, pulling any missing
    /// attachment blobs first. Returns true when the tree changed.
    fn apply_pulled(&mut self, unit: &TransferUnit) -> ReplicatorResult<bool> {
        unit.validate().map_err(|e| {
            ReplicatorError::Store(StoreError::invalid_history(&unit.doc_id, e.to_string()))
        })?;
        self.fetch_missing_blobs(unit)?;
        let applied = self.inner.config.local.put_revision(
            &unit.doc_id,
            &unit.history,
            unit.deleted,
            unit.body.clone().map(Bytes::from),
            unit.attachments.clone(),
        )?;
        match applied {
            ApplyOutcome::Applied => Ok(true),
            ApplyOutcome::ConflictCreated => {
                self.resolve_conflicts(&unit.doc_id, Some(&unit.rev_id))?;
                Ok(true)
            }
            ApplyOutcome::AlreadyPresent => {
                // A crash between graft and resolution leaves the
                // conflict behind; settle it on redelivery.
                self.resolve_conflicts(&unit.doc_id, Some(&unit.rev_id))?;
                Ok(false)
            }
        }
    }

    fn fetch_missing_blobs(&mut self, unit: &TransferUnit) -> ReplicatorResult<()> {
        for attachment in &unit.attachments {
            if self.inner.config.local_blobs.contains(&attachment.digest)? {
                continue;
            }
            let digest = attachment.digest;
            let reply = self.request(&Message::BlobGet(BlobGetRequest { digest }))?;
            let got = match reply {
                Message::BlobGetAck(got) => got,
                other => return Err(unexpected("BlobGetAck", other.kind())),
            };
            let Some(content) = got.content else {
                return Err(ReplicatorError::Store(StoreError::corrupt(format!(
                    "peer lost attachment blob {digest} referenced by {}",
                    unit.doc_id
                ))));
            };
            // write() re-derives the digest, so a corrupted transfer
            // surfaces here as a document-scoped error.
            self.inner
                .config
                .local_blobs
                .write(&digest, Bytes::from(content))?;
        }
        Ok(())
    }

    /// Settle every conflict on `doc_id`, one pair of leaves at a time.
    fn resolve_conflicts(
        &mut self,
        doc_id: &str,
        remote_hint: Option<&RevisionId>,
    ) -> ReplicatorResult<()> {
        loop {
            let leaves = self.inner.config.local.live_leaves(doc_id)?;
            if leaves.len() < 2 {
                return Ok(());
            }
            let (local_rev, remote_rev) = match remote_hint {
                Some(hint) if leaves.contains(hint) => {
                    match leaves.iter().find(|leaf| *leaf != hint).cloned() {
                        Some(other) => (other, hint.clone()),
                        None => return Ok(()),
                    }
                }
                _ => (leaves[0].clone(), leaves[1].clone()),
            };
            let conflict = self.load_conflict(doc_id, &local_rev, &remote_rev)?;
            let resolution = run_resolver(self.inner.resolver.as_ref(), &conflict)?;
            self.apply_resolution(doc_id, &local_rev, &remote_rev, resolution)?;
            tracing::debug!(doc = doc_id, "conflict settled");
        }
    }

    fn load_conflict(
        &self,
        doc_id: &str,
        local_rev: &RevisionId,
        remote_rev: &RevisionId,
    ) -> ReplicatorResult<ConflictBodies> {
        let local = self.revision_view(doc_id, local_rev)?;
        let remote = self.revision_view(doc_id, remote_rev)?;
        let store = &self.inner.config.local;
        let local_history = store.revision_history(doc_id, local_rev)?;
        let remote_history = store.revision_history(doc_id, remote_rev)?;
        let ancestor = match common_ancestor(&local_history, &remote_history) {
            Some(id) => Some(self.revision_view(doc_id, &id)?),
            None => None,
        };
        Ok(ConflictBodies {
            doc_id: doc_id.to_string(),
            local,
            remote,
            ancestor,
        })
    }

    fn revision_view(&self, doc_id: &str, rev_id: &RevisionId) -> ReplicatorResult<RevisionView> {
        let store = &self.inner.config.local;
        let revision = store.revision(doc_id, rev_id)?;
        let body = if revision.deleted {
            None
        } else {
            match store.revision_body(doc_id, rev_id)? {
                Some(bytes) => Some(serde_json::from_slice(&bytes).map_err(|e| {
                    ReplicatorError::Store(StoreError::corrupt(format!(
                        "bad body for {doc_id}: {e}"
                    )))
                })?),
                None => None,
            }
        };
        Ok(RevisionView {
            rev_id: rev_id.clone(),
            deleted: revision.deleted,
            body,
        })
    }

    fn apply_resolution(
        &mut self,
        doc_id: &str,
        local_rev: &RevisionId,
        remote_rev: &RevisionId,
        resolution: Resolution,
    ) -> ReplicatorResult<()> {
        let store = &self.inner.config.local;
        match resolution {
            Resolution::UseLocal => {
                store.resolve_conflict(doc_id, local_rev, remote_rev, None)?;
            }
            Resolution::UseRemote => {
                store.resolve_conflict(doc_id, remote_rev, local_rev, None)?;
            }
            Resolution::Merged(value) => {
                let body = serde_json::to_vec(&value).map_err(|e| {
                    ReplicatorError::Store(StoreError::corrupt(format!(
                        "unencodable merge for {doc_id}: {e}"
                    )))
                })?;
                // Hang the merged body off the higher branch so every
                // replica that merges the same pair lands on the same
                // revision id.
                let (winner, loser) = if local_rev >= remote_rev {
                    (local_rev, remote_rev)
                } else {
                    (remote_rev, local_rev)
                };
                store.resolve_conflict(doc_id, winner, loser, Some(Bytes::from(body)))?;
            }
        }
        Ok(())
    }

    // ---- push ----

    fn push_pass(&mut self) -> ReplicatorResult<u64> {
        let mut moved = 0u64;
        loop {
            self.inner.check_interrupt()?;
            let (batch, bound, _maybe_more) = self.collect_push_batch()?;
            if batch.is_empty() {
                let store_bound = self.inner.config.local.last_sequence()?;
                self.seen_local = self.seen_local.max(store_bound);
                if store_bound > self.checkpoint.local_sequence {
                    self.checkpoint.local_sequence = store_bound;
                    self.save_checkpoint()?;
                }
                break;
            }
            self.seen_local = self.seen_local.max(bound);
            self.inner.note_busy();
            self.inner.add_progress(batch.len() as u64, 0);

            let mut outcome = self.with_retry("push batch", |p| p.push_batch(&batch))?;
            moved += outcome.pushed;

            for conflict in std::mem::take(&mut outcome.conflicts) {
                match self.reconcile_push_conflict(&conflict.doc_id, &conflict.remote_rev) {
                    Ok(pushed) => {
                        // The settlement closed out this entry; no Apply
                        // result will credit it, so account for it here.
                        moved += pushed;
                        outcome.completed += 1;
                    }
                    Err(error) if error.is_document_scoped() => {
                        tracing::warn!(
                            doc = %conflict.doc_id,
                            %error,
                            "push conflict left unsettled"
                        );
                        outcome.failed.push(conflict.sequence);
                        self.inner.post_document_event(DocumentEvent {
                            doc_id: conflict.doc_id,
                            pushing: true,
                            deleted: false,
                            error: Some(error),
                        });
                    }
                    Err(error) => return Err(error),
                }
            }
            self.inner.add_progress(0, outcome.completed);

            let advance_to = match outcome.failed.iter().min() {
                Some(first_failed) => first_failed.saturating_sub(1),
                None => bound,
            };
            if advance_to > self.checkpoint.local_sequence {
                self.checkpoint.local_sequence = advance_to;
                self.save_checkpoint()?;
            }
            if !outcome.failed.is_empty() {
                break;
            }
            // Loop again: conflict settlements committed above the
            // bound and present themselves as fresh changes.
        }
        Ok(moved)
    }

    fn collect_push_batch(&mut self) -> ReplicatorResult<(Vec<PushCandidate>, u64, bool)> {
        let config = &self.inner.config;
        let mut cursor = config
            .local
            .changes_since(self.checkpoint.local_sequence, config.doc_ids.as_deref())?;
        let limit = config.batch_size as usize;
        let mut batch = Vec::new();
        let mut bound = self.checkpoint.local_sequence;
        let mut more = false;
        while let Some(entry) = cursor.next()? {
            if batch.len() >= limit {
                more = true;
                break;
            }
            bound = entry.sequence;
            let history = config.local.revision_history(&entry.doc_id, &entry.rev_id)?;
            batch.push(PushCandidate { entry, history });
        }
        Ok((batch, bound, more))
    }

    fn push_batch(&mut self, batch: &[PushCandidate]) -> ReplicatorResult<PushOutcome> {
        let mut outcome = PushOutcome::default();
        let proposals: Vec<Proposal> = batch
            .iter()
            .map(|candidate| Proposal {
                doc_id: candidate.entry.doc_id.clone(),
                rev_id: candidate.entry.rev_id.clone(),
                history: candidate.history.clone(),
            })
            .collect();
        let reply = self.request(&Message::Propose(ProposeRequest { proposals }))?;
        let ack = match reply {
            Message::ProposeAck(ack) => ack,
            other => return Err(unexpected("ProposeAck", other.kind())),
        };
        let verdicts: HashMap<&str, &Verdict> = ack
            .verdicts
            .iter()
            .map(|v| (v.doc_id.as_str(), &v.verdict))
            .collect();

        let mut to_send = Vec::new();
        for candidate in batch {
            let doc_id = candidate.entry.doc_id.as_str();
            match verdicts.get(doc_id) {
                Some(Verdict::NotNeeded) => {
                    // The peer has it, however it got there. Retain the
                    // body so later merges still find their base.
                    self.inner
                        .config
                        .local
                        .mark_synced(doc_id, &candidate.entry.rev_id)?;
                    outcome.completed += 1;
                }
                Some(Verdict::Send) => to_send.push(candidate),
                Some(Verdict::Conflict { rev_id, .. }) => {
                    outcome.conflicts.push(PushConflict {
                        doc_id: doc_id.to_string(),
                        remote_rev: rev_id.clone(),
                        sequence: candidate.entry.sequence,
                    });
                }
                None => self.fail_push(
                    &mut outcome,
                    candidate,
                    ReplicatorError::protocol(format!("no verdict for {doc_id}")),
                ),
            }
        }
        if to_send.is_empty() {
            return Ok(outcome);
        }

        let mut units = Vec::new();
        let mut sent: HashMap<String, (u64, RevisionId, bool)> = HashMap::new();
        for candidate in &to_send {
            match self.build_push_unit(candidate) {
                Ok(Some(unit)) => {
                    sent.insert(
                        unit.doc_id.clone(),
                        (candidate.entry.sequence, unit.rev_id.clone(), unit.deleted),
                    );
                    units.push(unit);
                }
                // Body pruned mid-session: a newer local revision
                // exists and will re-present with its own entry.
                Ok(None) => outcome.completed += 1,
                Err(error) if error.is_document_scoped() => {
                    self.fail_push(&mut outcome, candidate, error);
                }
                Err(error) => return Err(error),
            }
        }
        if units.is_empty() {
            return Ok(outcome);
        }

        let lost = self.upload_blobs(&units)?;
        if !lost.is_empty() {
            let (kept, dropped): (Vec<_>, Vec<_>) = units.into_iter().partition(|unit| {
                !unit
                    .attachments
                    .iter()
                    .any(|attachment| lost.contains(&attachment.digest))
            });
            for unit in dropped {
                if let Some((sequence, _, deleted)) = sent.get(&unit.doc_id) {
                    let error = ReplicatorError::Store(StoreError::corrupt(format!(
                        "attachment blob missing locally for {}",
                        unit.doc_id
                    )));
                    tracing::warn!(doc = %unit.doc_id, %error, "push failed for document");
                    outcome.failed.push(*sequence);
                    self.inner.post_document_event(DocumentEvent {
                        doc_id: unit.doc_id,
                        pushing: true,
                        deleted: *deleted,
                        error: Some(error),
                    });
                }
            }
            units = kept;
        }
        if units.is_empty() {
            return Ok(outcome);
        }

        let reply = self.request(&Message::Apply(ApplyRequest { units }))?;
        let apply_ack = match reply {
            Message::ApplyAck(ack) => ack,
            other => return Err(unexpected("ApplyAck", other.kind())),
        };
        for result in apply_ack.results {
            let Some((sequence, rev_id, deleted)) = sent.get(&result.doc_id).cloned() else {
                tracing::debug!(doc = %result.doc_id, "apply result for a unit we did not send");
                continue;
            };
            match result.outcome {
                Some(applied) => {
                    if applied != ApplyOutcome::AlreadyPresent {
                        outcome.pushed += 1;
                    }
                    self.inner.config.local.mark_synced(&result.doc_id, &rev_id)?;
                    outcome.completed += 1;
                    self.inner.post_document_event(DocumentEvent {
                        doc_id: result.doc_id,
                        pushing: true,
                        deleted,
                        error: None,
                    });
                }
                None => {
                    let message = result.error.unwrap_or_else(|| "apply failed".to_string());
                    let error = ReplicatorError::Store(StoreError::invalid_history(
                        &result.doc_id,
                        format!("rejected by peer: {message}"),
                    ));
                    tracing::warn!(doc = %result.doc_id, %error, "push rejected");
                    outcome.failed.push(sequence);
                    self.inner.post_document_event(DocumentEvent {
                        doc_id: result.doc_id,
                        pushing: true,
                        deleted,
                        error: Some(error),
                    });
                }
            }
        }
        Ok(outcome)
    }

    fn fail_push(&self, outcome: &mut PushOutcome, candidate: &PushCandidate, error: ReplicatorError) {
        tracing::warn!(doc = %candidate.entry.doc_id, %error, "push failed for document");
        outcome.failed.push(candidate.entry.sequence);
        self.inner.post_document_event(DocumentEvent {
            doc_id: candidate.entry.doc_id.clone(),
            pushing: true,
            deleted: candidate.entry.deleted,
            error: Some(error),
        });
    }

    fn build_push_unit(&self, candidate: &PushCandidate) -> ReplicatorResult<Option<TransferUnit>> {
        self.build_unit_for(&candidate.entry.doc_id, &candidate.entry.rev_id)
    }

    fn build_unit_for(
        &self,
        doc_id: &str,
        rev_id: &RevisionId,
    ) -> ReplicatorResult<Option<TransferUnit>> {
        let store = &self.inner.config.local;
        let revision = store.revision(doc_id, rev_id)?;
        let body = store.revision_body(doc_id, rev_id)?;
        if body.is_none() && !revision.deleted {
            return Ok(None);
        }
        let history = store.revision_history(doc_id, rev_id)?;
        Ok(Some(TransferUnit {
            doc_id: doc_id.to_string(),
            rev_id: rev_id.clone(),
            history,
            deleted: revision.deleted,
            body: body.map(|bytes| bytes.to_vec()),
            attachments: revision.attachments,
        }))
    }

    /// Ensure the peer holds every blob the units reference. Returns
    /// the digests this side could not provide.
    fn upload_blobs(&mut self, units: &[TransferUnit]) -> ReplicatorResult<HashSet<BlobDigest>> {
        let mut digests = Vec::new();
        let mut seen = HashSet::new();
        for unit in units {
            for attachment in &unit.attachments {
                if seen.insert(attachment.digest) {
                    digests.push(attachment.digest);
                }
            }
        }
        let mut lost = HashSet::new();
        if digests.is_empty() {
            return Ok(lost);
        }
        let reply = self.request(&Message::BlobCheck(BlobCheckRequest { digests }))?;
        let check = match reply {
            Message::BlobCheckAck(ack) => ack,
            other => return Err(unexpected("BlobCheckAck", other.kind())),
        };
        for digest in check.missing {
            match self.inner.config.local_blobs.read(&digest)? {
                Some(content) => {
                    let reply = self.request(&Message::BlobPut(BlobPutRequest {
                        digest,
                        content: content.to_vec(),
                    }))?;
                    match reply {
                        Message::BlobPutAck(_) => {}
                        other => return Err(unexpected("BlobPutAck", other.kind())),
                    }
                }
                None => {
                    lost.insert(digest);
                }
            }
        }
        Ok(lost)
    }

    /// A push came back with a conflict verdict: import the peer's
    /// branch, settle the conflict here, then ship the settlement back
    /// so both trees expose the same revision.
    fn reconcile_push_conflict(
        &mut self,
        doc_id: &str,
        remote_rev: &RevisionId,
    ) -> ReplicatorResult<u64> {
        let want_doc = doc_id.to_string();
        let want_rev = remote_rev.clone();
        let fetch_ack = self.with_retry("fetch conflicting branch", move |p| {
            let reply = p.request(&Message::Fetch(FetchRequest {
                wants: vec![Want {
                    doc_id: want_doc.clone(),
                    rev_id: Some(want_rev.clone()),
                }],
            }))?;
            match reply {
                Message::FetchAck(ack) => Ok(ack),
                other => Err(unexpected("FetchAck", other.kind())),
            }
        })?;
        let Some(unit) = fetch_ack.units.into_iter().next() else {
            // The branch vanished between propose and fetch; the next
            // propose round re-evaluates from scratch.
            return Ok(0);
        };
        self.apply_pulled(&unit)?;

        // Ship the settlement: the tombstone that closed their branch,
        // then our surviving branch, applied in that order so their
        // winner rule lands where ours did.
        let mut units = Vec::new();
        let closer = RevisionId::derive(Some(remote_rev), true, None);
        match self.inner.config.local.revision(doc_id, &closer) {
            Ok(_) => {
                if let Some(unit) = self.build_unit_for(doc_id, &closer)? {
                    units.push(unit);
                }
            }
            Err(StoreError::DocumentNotFound { .. } | StoreError::RevisionNotFound { .. }) => {}
            Err(other) => return Err(other.into()),
        }
        if let Some(exposed) = self.inner.config.local.exposed_revision(doc_id)? {
            if !exposed.deleted && exposed.id != *remote_rev {
                if let Some(unit) = self.build_unit_for(doc_id, &exposed.id)? {
                    units.push(unit);
                }
            }
        }
        if units.is_empty() {
            // Their branch won outright; nothing to send back.
            return Ok(0);
        }

        let lost = self.upload_blobs(&units)?;
        if !lost.is_empty() {
            return Err(ReplicatorError::Store(StoreError::corrupt(format!(
                "attachment blobs missing locally for {doc_id}"
            ))));
        }
        let deleted = units.last().map(|unit| unit.deleted).unwrap_or(false);
        let request_units = units.clone();
        let ack = self.with_retry("push settlement", move |p| {
            let reply = p.request(&Message::Apply(ApplyRequest {
                units: request_units.clone(),
            }))?;
            match reply {
                Message::ApplyAck(ack) => Ok(ack),
                other => Err(unexpected("ApplyAck", other.kind())),
            }
        })?;
        let mut pushed = 0u64;
        for result in ack.results {
            match result.outcome {
                Some(applied) => {
                    if applied != ApplyOutcome::AlreadyPresent {
                        pushed += 1;
                    }
                }
                None => {
                    let message = result.error.unwrap_or_else(|| "apply failed".to_string());
                    return Err(ReplicatorError::Store(StoreError::invalid_history(
                        &result.doc_id,
                        format!("rejected by peer: {message}"),
                    )));
                }
            }
        }
        for unit in &units {
            self.inner.config.local.mark_synced(&unit.doc_id, &unit.rev_id)?;
        }
        self.inner.post_document_event(DocumentEvent {
            doc_id: doc_id.to_string(),
            pushing: true,
            deleted,
            error: None,
        });
        Ok(pushed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;

    use foliodb_store::MemoryStore;

    use crate::config::{Direction, Endpoint, ReplicatorConfig};
    use crate::replicator::Inner;
    use crate::resolver::MergeResolver;
    use crate::transport::{Connector, LocalConnector};

    fn pipeline_for(inner: &Inner) -> Pipeline<'_> {
        let mut channel = LocalConnector.connect(&inner.config.target).expect("connect");
        let ack = handshake(channel.as_mut(), &inner.config).expect("handshake");
        assert_eq!(ack.protocol_version, PROTOCOL_VERSION);
        let identity = SessionIdentity::derive(&inner.config);
        let checkpoint = inner
            .checkpoints
            .load(&identity)
            .expect("load checkpoint")
            .unwrap_or_default();
        Pipeline::new(inner, channel, checkpoint, identity)
    }

    #[test]
    fn push_cycle_moves_documents_and_advances_checkpoint() {
        let local = MemoryStore::new();
        let target = MemoryStore::new();
        local.save("pet-1", &json!({"species": "tiger"})).unwrap();
        local.save("pet-2", &json!({"species": "lynx"})).unwrap();
        local.save("pet-3", &json!({"species": "caracal"})).unwrap();

        let config = ReplicatorConfig::new(
            Arc::new(local.clone()),
            Arc::new(local.blobs()),
            Endpoint::local(Arc::new(target.clone()), Arc::new(target.blobs())),
            Direction::Push,
        );
        let inner = Inner::build(config);
        let mut pipeline = pipeline_for(&inner);

        let moved = pipeline.run_cycle().expect("cycle");
        assert_eq!(moved, 3);
        assert_eq!(target.document_count().unwrap(), 3);
        assert_eq!(
            target.get("pet-2").unwrap().expect("replicated")["species"],
            json!("lynx")
        );

        let saved = inner
            .checkpoints
            .load(&pipeline.identity)
            .unwrap()
            .expect("checkpoint saved");
        assert_eq!(saved.local_sequence, local.last_sequence().unwrap());
    }

    #[test]
    fn pull_resolves_divergent_edits_with_merge() {
        let local = MemoryStore::new();
        let remote = MemoryStore::new();
        // Identical first writes derive the same revision id on both
        // sides, so the trees share a root without any transfer.
        local.save("pet-1", &json!({"species": "tiger"})).unwrap();
        remote.save("pet-1", &json!({"species": "tiger"})).unwrap();
        local
            .save("pet-1", &json!({"species": "tiger", "name": "hobbes"}))
            .unwrap();
        remote
            .save("pet-1", &json!({"species": "tiger", "pattern": "striped"}))
            .unwrap();

        let config = ReplicatorConfig::new(
            Arc::new(local.clone()),
            Arc::new(local.blobs()),
            Endpoint::local(Arc::new(remote.clone()), Arc::new(remote.blobs())),
            Direction::Pull,
        )
        .with_resolver(Arc::new(MergeResolver));
        let inner = Inner::build(config);
        let mut pipeline = pipeline_for(&inner);

        pipeline.run_cycle().expect("cycle");

        let merged = local.get("pet-1").unwrap().expect("document survives");
        assert_eq!(merged["name"], json!("hobbes"));
        assert_eq!(merged["pattern"], json!("striped"));
        assert_eq!(local.live_leaves("pet-1").unwrap().len(), 1);
    }

    #[test]
    fn push_conflict_is_imported_settled_and_shipped_back() {
        let local = MemoryStore::new();
        let remote = MemoryStore::new();
        local.save("pet-1", &json!({"species": "tiger"})).unwrap();
        remote.save("pet-1", &json!({"species": "tiger"})).unwrap();
        local
            .save("pet-1", &json!({"species": "tiger", "mood": "grumpy"}))
            .unwrap();
        remote
            .save("pet-1", &json!({"species": "tiger", "mood": "playful"}))
            .unwrap();

        let config = ReplicatorConfig::new(
            Arc::new(local.clone()),
            Arc::new(local.blobs()),
            Endpoint::local(Arc::new(remote.clone()), Arc::new(remote.blobs())),
            Direction::Push,
        );
        let inner = Inner::build(config);
        let mut pipeline = pipeline_for(&inner);

        pipeline.run_cycle().expect("cycle");

        let ours = local.get("pet-1").unwrap().expect("local document");
        let theirs = remote.get("pet-1").unwrap().expect("remote document");
        assert_eq!(ours, theirs);
        assert_eq!(local.live_leaves("pet-1").unwrap().len(), 1);
        assert_eq!(remote.live_leaves("pet-1").unwrap().len(), 1);

        // The conflicted entry and its settlement are both discovered,
        // and both must be credited once the conflict is reconciled.
        let progress = inner.snapshot().progress;
        assert_eq!(progress.total, 2);
        assert_eq!(progress.completed, progress.total);
    }

    #[test]
    fn push_propagates_deletions() {
        let local = MemoryStore::new();
        let remote = MemoryStore::new();
        local.save("pet-1", &json!({"species": "tiger"})).unwrap();

        let config = ReplicatorConfig::new(
            Arc::new(local.clone()),
            Arc::new(local.blobs()),
            Endpoint::local(Arc::new(remote.clone()), Arc::new(remote.blobs())),
            Direction::Push,
        );
        let inner = Inner::build(config);
        let mut pipeline = pipeline_for(&inner);
        pipeline.run_cycle().expect("first cycle");
        assert!(remote.get("pet-1").unwrap().is_some());

        local.delete("pet-1").unwrap();
        pipeline.run_cycle().expect("second cycle");
        assert!(remote.get("pet-1").unwrap().is_none());
    }
}
