//! In-process channel pair backed by unbounded mpsc queues.

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use super::{Channel, EnvelopeSink, EnvelopeSource};
use crate::error::{WdbError, WdbResult};
use crate::messages::Envelope;

struct MemorySink {
    tx: Option<mpsc::UnboundedSender<Envelope>>,
}

impl EnvelopeSink for MemorySink {
    fn send<'a>(&'a mut self, envelope: &'a Envelope) -> BoxFuture<'a, WdbResult<()>> {
        Box::pin(async move {
            let tx = self.tx.as_ref().ok_or(WdbError::ConnectionClosed)?;
            tx.send(envelope.clone())
                .map_err(|_| WdbError::Transport("peer dropped its receiver".into()))
        })
    }

    fn close(&mut self) -> BoxFuture<'_, WdbResult<()>> {
        Box::pin(async move {
            self.tx = None;
            Ok(())
        })
    }
}

struct MemorySource {
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl EnvelopeSource for MemorySource {
    fn recv(&mut self) -> BoxFuture<'_, WdbResult<Option<Envelope>>> {
        Box::pin(async move { Ok(self.rx.recv().await) })
    }
}

/// Two connected channel ends: whatever one sends, the other receives.
pub fn memory_pair() -> (Channel, Channel) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();

    let a = Channel::new(
        Box::new(MemorySink { tx: Some(a_tx) }),
        Box::new(MemorySource { rx: a_rx }),
    );
    let b = Channel::new(
        Box::new(MemorySink { tx: Some(b_tx) }),
        Box::new(MemorySource { rx: b_rx }),
    );
    (a, b)
}
