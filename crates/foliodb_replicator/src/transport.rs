//! Channels to the passive side.
//!
//! The replicator speaks request/reply over a [`Channel`]; a
//! [`Connector`] turns an [`Endpoint`] into one. The in-process
//! [`LocalConnector`] serves store-to-store sessions and the test
//! suite; both directions still pass through the wire codec so the
//! serialized protocol is exercised even without a network.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use foliodb_repl_protocol::{decode, encode, Message};

use crate::config::Endpoint;
use crate::error::{ReplicatorError, ReplicatorResult};
use crate::responder::Responder;

/// A request/reply pipe to the passive side.
pub trait Channel: Send {
    /// Send one message.
    fn send(&mut self, message: &Message) -> ReplicatorResult<()>;

    /// Receive the next message.
    fn receive(&mut self) -> ReplicatorResult<Message>;

    /// Release the channel. Default is a no-op.
    fn close(&mut self) {}

    /// Send a request and wait for its reply, surfacing a protocol
    /// `Error` reply as a transport error with the peer's retryability
    /// verdict.
    fn request(&mut self, message: &Message) -> ReplicatorResult<Message> {
        self.send(message)?;
        let reply = self.receive()?;
        if let Message::Error(err) = reply {
            return Err(ReplicatorError::Transport {
                message: err.message,
                retryable: err.retryable,
            });
        }
        Ok(reply)
    }
}

/// Builds channels to an endpoint.
pub trait Connector: Send + Sync {
    /// Open a channel, or fail with a retryable error when the
    /// endpoint is temporarily unreachable.
    fn connect(&self, target: &Endpoint) -> ReplicatorResult<Box<dyn Channel>>;
}

/// Connector for [`Endpoint::Local`] targets. Remote endpoints are
/// reported unreachable-but-retryable, which is what a network
/// connector would say about a peer that is down.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalConnector;

impl Connector for LocalConnector {
    fn connect(&self, target: &Endpoint) -> ReplicatorResult<Box<dyn Channel>> {
        match target {
            Endpoint::Local { store, blobs } => {
                if !store.is_open() {
                    return Err(ReplicatorError::StoreUnavailable);
                }
                let responder = Responder::new(store.clone(), blobs.clone());
                Ok(Box::new(LocalChannel::new(responder)))
            }
            Endpoint::Remote { url } => Err(ReplicatorError::transport_retryable(format!(
                "no route to remote endpoint {url}"
            ))),
        }
    }
}

/// In-process channel that hands each request straight to a
/// [`Responder`]. Messages are encoded and decoded on both legs so the
/// codec path is identical to a networked session.
pub struct LocalChannel {
    responder: Responder,
    pending: Option<Vec<u8>>,
    closed: bool,
}

impl LocalChannel {
    /// A channel served by `responder`.
    pub fn new(responder: Responder) -> Self {
        LocalChannel {
            responder,
            pending: None,
            closed: false,
        }
    }
}

impl Channel for LocalChannel {
    fn send(&mut self, message: &Message) -> ReplicatorResult<()> {
        if self.closed {
            return Err(ReplicatorError::transport_fatal("channel is closed"));
        }
        let bytes = encode(message)?;
        let request = decode(&bytes)?;
        let reply = self.responder.handle(request);
        self.pending = Some(encode(&reply)?);
        Ok(())
    }

    fn receive(&mut self) -> ReplicatorResult<Message> {
        if self.closed {
            return Err(ReplicatorError::transport_fatal("channel is closed"));
        }
        match self.pending.take() {
            Some(bytes) => Ok(decode(&bytes)?),
            None => Err(ReplicatorError::transport_fatal("no reply pending")),
        }
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// Scriptable channel for unit tests: replies are queued up front and
/// every sent message is recorded.
#[derive(Default)]
pub struct MockChannel {
    replies: VecDeque<ReplicatorResult<Message>>,
    sent: Arc<Mutex<Vec<Message>>>,
}

impl MockChannel {
    /// An empty channel; receiving without a scripted reply fails.
    pub fn new() -> Self {
        MockChannel::default()
    }

    /// Queue a successful reply.
    pub fn push_reply(&mut self, reply: Message) {
        self.replies.push_back(Ok(reply));
    }

    /// Queue a transport failure.
    pub fn push_failure(&mut self, error: ReplicatorError) {
        self.replies.push_back(Err(error));
    }

    /// Shared handle to the log of sent messages.
    pub fn sent_log(&self) -> Arc<Mutex<Vec<Message>>> {
        self.sent.clone()
    }
}

impl Channel for MockChannel {
    fn send(&mut self, message: &Message) -> ReplicatorResult<()> {
        self.sent.lock().push(message.clone());
        Ok(())
    }

    fn receive(&mut self) -> ReplicatorResult<Message> {
        self.replies
            .pop_front()
            .unwrap_or_else(|| Err(ReplicatorError::transport_fatal("no scripted reply")))
    }
}
