//! Raw envelope channels between the coordinator and one worker.
//!
//! A [`Channel`] is split into a sending half ([`EnvelopeSink`]) and a
//! receiving half ([`EnvelopeSource`]) so that one task can write while
//! another reads. Two implementations ship with the crate:
//!
//! - [`memory_pair`]: in-process, envelopes are moved through tokio mpsc
//!   queues without encoding.
//! - [`framed`]: any `AsyncRead`/`AsyncWrite` pair (pipes, child stdio),
//!   envelopes encoded as length-prefixed CBOR frames.

pub mod framed;
pub mod memory;

pub use framed::{duplex_pair, framed};
pub use memory::memory_pair;

use futures_util::future::BoxFuture;

use crate::error::WdbResult;
use crate::messages::{Envelope, WorkerKind};

/// Sending half of a channel. Sends on one sink are delivered in order.
pub trait EnvelopeSink: Send {
    /// Queue an envelope for the peer.
    fn send<'a>(&'a mut self, envelope: &'a Envelope) -> BoxFuture<'a, WdbResult<()>>;

    /// Close the sending direction. The peer observes end-of-stream.
    fn close(&mut self) -> BoxFuture<'_, WdbResult<()>>;
}

/// Receiving half of a channel.
pub trait EnvelopeSource: Send {
    /// Next envelope in arrival order. `Ok(None)` once the peer is gone.
    fn recv(&mut self) -> BoxFuture<'_, WdbResult<Option<Envelope>>>;
}

/// A duplex envelope transport bound to exactly one worker.
pub struct Channel {
    pub sink: Box<dyn EnvelopeSink>,
    pub source: Box<dyn EnvelopeSource>,
}

impl Channel {
    pub fn new(sink: Box<dyn EnvelopeSink>, source: Box<dyn EnvelopeSource>) -> Self {
        Self { sink, source }
    }

    pub async fn send(&mut self, envelope: &Envelope) -> WdbResult<()> {
        self.sink.send(envelope).await
    }

    pub async fn recv(&mut self) -> WdbResult<Option<Envelope>> {
        self.source.recv().await
    }
}

/// Starts worker contexts of a given kind.
///
/// `Ok(None)` means the kind does not exist in this environment, which is a
/// normal outcome and not a failure.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, kind: WorkerKind) -> BoxFuture<'_, WdbResult<Option<Channel>>>;
}
