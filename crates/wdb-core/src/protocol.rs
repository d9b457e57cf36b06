//! Request/response correlation and notification dispatch over a [`Channel`].
//!
//! A [`ProtocolChannel`] owns three background tasks:
//!
//! - a writer draining an ordered outgoing queue into the channel sink,
//! - a reader routing responses to waiting callers and notifications to the
//!   [`Responder`],
//! - a serve loop answering inbound requests one at a time, in arrival order.
//!
//! Both endpoints use the same type; what differs is the responder they plug
//! in.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{WdbError, WdbResult};
use crate::messages::*;
use crate::transport::{Channel, EnvelopeSink, EnvelopeSource};

/// Endpoint-specific behavior plugged into a [`ProtocolChannel`].
pub trait Responder: Send + Sync + 'static {
    /// Serve a request sent by the peer.
    fn handle_request(&self, payload: RequestPayload) -> BoxFuture<'_, WdbResult<ResponsePayload>>;

    /// Receive an unsolicited notification from the peer.
    fn handle_notification(&self, notification: NotificationPayload);

    /// Called once after the channel terminated and pending requests failed.
    fn on_closed(&self) {}
}

enum Outgoing {
    Envelope(Envelope),
    Close,
}

type Slot = oneshot::Sender<WdbResult<ResponseBody>>;

#[derive(Default)]
struct PendingTable {
    next_id: u32,
    slots: HashMap<u32, Slot>,
    closed: bool,
}

impl PendingTable {
    /// Next id not currently awaiting a response.
    fn allocate_id(&mut self) -> u32 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.slots.contains_key(&id) {
                return id;
            }
        }
    }
}

struct Shared {
    pending: Mutex<PendingTable>,
    closed_tx: watch::Sender<bool>,
}

impl Shared {
    /// Mark the channel closed and fail every waiter. Idempotent.
    async fn terminate(&self) {
        let drained: Vec<(u32, Slot)> = {
            let mut table = self.pending.lock().await;
            if table.closed {
                return;
            }
            table.closed = true;
            table.slots.drain().collect()
        };

        if !drained.is_empty() {
            debug!(count = drained.len(), "failing pending requests on closed channel");
        }
        for (_, slot) in drained {
            let _ = slot.send(Err(WdbError::ConnectionClosed));
        }
        self.closed_tx.send_replace(true);
    }
}

/// Request/response/notification endpoint over one channel.
pub struct ProtocolChannel {
    outgoing: mpsc::UnboundedSender<Outgoing>,
    shared: Arc<Shared>,
    request_timeout: Option<Duration>,
    tasks: Vec<JoinHandle<()>>,
}

impl ProtocolChannel {
    /// Start serving `channel` with the given responder.
    pub fn new(channel: Channel, responder: Arc<dyn Responder>) -> Self {
        let Channel { sink, source } = channel;

        let (closed_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            pending: Mutex::new(PendingTable::default()),
            closed_tx,
        });

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(Self::write_loop(sink, outgoing_rx, shared.clone()));
        let reader = tokio::spawn(Self::read_loop(
            source,
            inbound_tx,
            shared.clone(),
            responder.clone(),
        ));
        let server = tokio::spawn(Self::serve_loop(inbound_rx, outgoing_tx.clone(), responder));

        Self {
            outgoing: outgoing_tx,
            shared,
            request_timeout: None,
            tasks: vec![writer, reader, server],
        }
    }

    /// Fail requests that receive no response within `timeout`.
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Send a request and wait for the matching response.
    ///
    /// A success payload of the wrong kind is a protocol error; an error
    /// payload is surfaced as [`WdbError::Engine`].
    pub async fn request(&self, payload: RequestPayload) -> WdbResult<ResponsePayload> {
        let kind = payload.kind();
        let expected = payload.expected_response();
        let (tx, rx) = oneshot::channel();

        let request_id = {
            let mut table = self.shared.pending.lock().await;
            if table.closed {
                return Err(WdbError::ConnectionClosed);
            }
            let id = table.allocate_id();
            table.slots.insert(id, tx);
            id
        };

        trace!(request_id, ?kind, "sending request");
        let envelope = Envelope::Request(Request {
            request_id,
            payload,
        });
        if self.outgoing.send(Outgoing::Envelope(envelope)).is_err() {
            self.forget(request_id).await;
            return Err(WdbError::ConnectionClosed);
        }

        let received = match self.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.forget(request_id).await;
                    warn!(request_id, ?kind, "request timed out");
                    return Err(WdbError::Timeout);
                }
            },
            None => rx.await,
        };
        let body = received.map_err(|_| WdbError::ConnectionClosed)??;

        match body {
            ResponseBody::Success(payload) if payload.kind() == expected => Ok(payload),
            ResponseBody::Success(payload) => Err(WdbError::UnexpectedResponse {
                expected,
                actual: payload.kind(),
            }),
            ResponseBody::Error(err) => Err(WdbError::Engine(err.message)),
        }
    }

    /// Send an unsolicited notification to the peer.
    pub fn notify(&self, payload: NotificationPayload) -> WdbResult<()> {
        let envelope = Envelope::Notification(Notification { payload });
        self.outgoing
            .send(Outgoing::Envelope(envelope))
            .map_err(|_| WdbError::ConnectionClosed)
    }

    /// Close the sending direction; the peer observes end-of-stream.
    pub fn close(&self) {
        let _ = self.outgoing.send(Outgoing::Close);
    }

    /// Whether the underlying channel has terminated.
    pub fn is_closed(&self) -> bool {
        *self.shared.closed_tx.borrow()
    }

    /// Resolves once the underlying channel has terminated.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Number of requests currently awaiting a response.
    pub async fn pending_requests(&self) -> usize {
        self.shared.pending.lock().await.slots.len()
    }

    async fn forget(&self, request_id: u32) {
        self.shared.pending.lock().await.slots.remove(&request_id);
    }

    // ── Internal ─────────────────────────────────────────────────────

    async fn write_loop(
        mut sink: Box<dyn EnvelopeSink>,
        mut outgoing_rx: mpsc::UnboundedReceiver<Outgoing>,
        shared: Arc<Shared>,
    ) {
        while let Some(item) = outgoing_rx.recv().await {
            match item {
                Outgoing::Envelope(envelope) => {
                    if let Err(e) = sink.send(&envelope).await {
                        warn!(error = %e, "failed to send envelope");
                        shared.terminate().await;
                        break;
                    }
                }
                Outgoing::Close => {
                    if let Err(e) = sink.close().await {
                        debug!(error = %e, "error closing channel sink");
                    }
                    break;
                }
            }
        }
        trace!("write loop ended");
    }

    async fn read_loop(
        mut source: Box<dyn EnvelopeSource>,
        inbound_tx: mpsc::UnboundedSender<Request>,
        shared: Arc<Shared>,
        responder: Arc<dyn Responder>,
    ) {
        loop {
            match source.recv().await {
                Ok(Some(Envelope::Response(response))) => {
                    Self::resolve(&shared, response).await;
                }
                Ok(Some(Envelope::Request(request))) => {
                    if inbound_tx.send(request).is_err() {
                        debug!("serve loop gone, dropping inbound request");
                    }
                }
                Ok(Some(Envelope::Notification(notification))) => {
                    responder.handle_notification(notification.payload);
                }
                Ok(None) => {
                    debug!("peer closed channel");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "channel receive failed");
                    break;
                }
            }
        }

        shared.terminate().await;
        responder.on_closed();
    }

    async fn resolve(shared: &Shared, response: Response) {
        let slot = shared.pending.lock().await.slots.remove(&response.request_id);
        match slot {
            Some(slot) => {
                trace!(request_id = response.request_id, "resolving request");
                let _ = slot.send(Ok(response.body));
            }
            None => {
                warn!(
                    request_id = response.request_id,
                    "dropping response for unknown request id"
                );
            }
        }
    }

    async fn serve_loop(
        mut inbound_rx: mpsc::UnboundedReceiver<Request>,
        outgoing: mpsc::UnboundedSender<Outgoing>,
        responder: Arc<dyn Responder>,
    ) {
        while let Some(request) = inbound_rx.recv().await {
            let request_id = request.request_id;
            let kind = request.payload.kind();
            trace!(request_id, ?kind, "serving request");

            let body = match responder.handle_request(request.payload).await {
                Ok(payload) => ResponseBody::Success(payload),
                Err(e) => {
                    debug!(request_id, ?kind, error = %e, "request failed");
                    // Engine messages travel bare; the requester re-wraps them.
                    let message = match e {
                        WdbError::Engine(message) => message,
                        other => other.to_string(),
                    };
                    ResponseBody::Error(ErrorPayload { message })
                }
            };

            let envelope = Envelope::Response(Response { request_id, body });
            if outgoing.send(Outgoing::Envelope(envelope)).is_err() {
                break;
            }
        }
    }
}

impl Drop for ProtocolChannel {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}
