//! # FolioDB Replication Protocol
//!
//! The wire layer replicas use to talk to each other:
//!
//! - CBOR-encoded request/response [`Message`]s driven by the active side
//! - [`TransferUnit`], the self-contained form of one revision in flight
//! - [`diff`], the ancestry comparison both sides agree on
//!
//! The protocol is transport-agnostic; anything that can move framed
//! bytes between two stores can carry a session.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod differ;
mod error;
mod message;
mod transfer;

pub use differ::{common_ancestor, diff, DiffOutcome};
pub use error::{ProtocolError, ProtocolResult};
pub use message::{
    decode, encode, ApplyRequest, ApplyResponse, ApplyResult, BlobCheckRequest, BlobCheckResponse,
    BlobGetRequest, BlobGetResponse, BlobPutRequest, BlobPutResponse, ChangesRequest,
    ChangesResponse, Credentials, ErrorResponse, FetchRequest, FetchResponse, Hello, HelloAck,
    Message, Proposal, ProposalVerdict, ProposeRequest, ProposeResponse, Verdict, Want,
    PROTOCOL_VERSION,
};
pub use transfer::TransferUnit;
