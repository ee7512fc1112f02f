//! Outbound delivery.
//!
//! Each live connection owns a bounded outbox. Actors enqueue encoded frames
//! into it and a single writer task per connection drains it onto the
//! socket, so writes to one connection are serialized and keep enqueue
//! order. Enqueueing never waits: a full outbox (the client stopped reading)
//! or a closed one (the connection is gone) drops the frame, so one stalled
//! socket cannot hold up the actors serving everyone else.

use std::fmt;
use std::hash::{Hash, Hasher};

use futures::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

use huddle_shared::protocol::Frame;
use huddle_shared::types::ConnId;

pub type OutboxReceiver = mpsc::Receiver<Frame>;

/// Sending half of a live connection. Cheap to clone; every registry that
/// needs to reach the connection holds a copy.
#[derive(Clone)]
pub struct Connection {
    id: ConnId,
    outbox: mpsc::Sender<Frame>,
}

impl Connection {
    pub fn new(id: ConnId, capacity: usize) -> (Self, OutboxReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { id, outbox: tx }, rx)
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Queue a frame for this connection without waiting. Returns `false`
    /// if the frame was dropped because the outbox is full or closed.
    pub fn deliver(&self, frame: Frame) -> bool {
        match self.outbox.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(conn = %self.id, "Dropping frame for slow connection");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(conn = %self.id, "Dropping frame for closed connection");
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.outbox.is_closed()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Connection {}

impl Hash for Connection {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Drain a connection's outbox into its socket sink until either side
/// closes. `encode` turns a frame into the sink's message type.
pub async fn run_writer<S, M, F>(conn: ConnId, mut outbox: OutboxReceiver, mut sink: S, encode: F)
where
    S: Sink<M> + Unpin,
    S::Error: fmt::Display,
    F: Fn(Frame) -> M,
{
    while let Some(frame) = outbox.recv().await {
        if let Err(e) = sink.send(encode(frame)).await {
            debug!(%conn, "Socket write failed, stopping writer: {}", e);
            break;
        }
    }
    let _ = sink.close().await;
    debug!(%conn, "Writer finished");
}
