//! Coordinator-side connection to one worker.
//!
//! Wraps a [`ProtocolChannel`] after the ready handshake and republishes the
//! worker's update notifications on a broadcast stream.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use wdb_core::messages::*;
use wdb_core::{Channel, ProtocolChannel, Responder, WdbError, WdbResult};

/// Updates buffered per subscriber before it starts lagging.
const UPDATE_BUFFER: usize = 256;

/// Multicast of update notifications. Dropping the sender completes every
/// stream.
struct UpdateHub {
    sender: Mutex<Option<broadcast::Sender<UpdateNotification>>>,
}

impl UpdateHub {
    fn open() -> Self {
        let (tx, _) = broadcast::channel(UPDATE_BUFFER);
        Self {
            sender: Mutex::new(Some(tx)),
        }
    }

    fn publish(&self, update: UpdateNotification) {
        if let Some(tx) = self.lock().as_ref() {
            // No receivers is fine: nobody is listening right now.
            let _ = tx.send(update);
        }
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<UpdateNotification>> {
        self.lock().as_ref().map(|tx| tx.subscribe())
    }

    fn close(&self) {
        self.lock().take();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<broadcast::Sender<UpdateNotification>>> {
        self.sender.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Responder plugged into the coordinator's side of the channel.
struct CoordinatorResponder {
    kind: WorkerKind,
    hub: Arc<UpdateHub>,
}

impl Responder for CoordinatorResponder {
    fn handle_request(&self, payload: RequestPayload) -> BoxFuture<'_, WdbResult<ResponsePayload>> {
        let kind = payload.kind();
        Box::pin(async move {
            Err(WdbError::NotImplemented(format!(
                "coordinator does not serve {kind:?} requests"
            )))
        })
    }

    fn handle_notification(&self, notification: NotificationPayload) {
        match notification {
            NotificationPayload::Update(update) => self.hub.publish(update),
            NotificationPayload::Ready(_) => {
                debug!(kind = ?self.kind, "ignoring repeated ready notification");
            }
        }
    }

    fn on_closed(&self) {
        info!(kind = ?self.kind, "worker connection closed");
        self.hub.close();
    }
}

/// A live, handshaken connection to one worker.
pub struct WorkerConnection {
    kind: WorkerKind,
    protocol: ProtocolChannel,
    hub: Arc<UpdateHub>,
}

impl WorkerConnection {
    /// Wait for the worker's ready notification, then start dispatching.
    pub async fn establish(
        kind: WorkerKind,
        mut channel: Channel,
        handshake_timeout: Duration,
        request_timeout: Option<Duration>,
    ) -> WdbResult<Self> {
        let first = tokio::time::timeout(handshake_timeout, channel.recv())
            .await
            .map_err(|_| WdbError::Timeout)??;

        match first {
            Some(Envelope::Notification(Notification {
                payload: NotificationPayload::Ready(ready),
            })) => {
                if ready.protocol_version != PROTOCOL_VERSION {
                    return Err(WdbError::Protocol(format!(
                        "worker speaks {}, expected {PROTOCOL_VERSION}",
                        ready.protocol_version
                    )));
                }
                if ready.kind != kind {
                    return Err(WdbError::Protocol(format!(
                        "spawned a {kind:?} worker but it reported {:?}",
                        ready.kind
                    )));
                }
            }
            Some(_) => {
                return Err(WdbError::Protocol(
                    "expected ready notification as first message".into(),
                ))
            }
            None => {
                return Err(WdbError::Transport(
                    "worker closed before becoming ready".into(),
                ))
            }
        }

        let hub = Arc::new(UpdateHub::open());
        let responder = Arc::new(CoordinatorResponder {
            kind,
            hub: hub.clone(),
        });
        let protocol =
            ProtocolChannel::new(channel, responder).with_request_timeout(request_timeout);

        info!(?kind, "worker connected");
        Ok(Self {
            kind,
            protocol,
            hub,
        })
    }

    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    /// Send a request and wait for its response.
    pub async fn request(&self, payload: RequestPayload) -> WdbResult<ResponsePayload> {
        self.protocol.request(payload).await
    }

    /// Update notifications for one database. Completes when the connection
    /// closes.
    pub fn updates_for(&self, database_id: u32) -> UpdateStream {
        UpdateStream {
            database_id,
            receiver: self.hub.subscribe(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.protocol.is_closed()
    }

    /// Close the connection; the worker sees end-of-stream and stops.
    pub fn close(&self) {
        self.protocol.close();
    }

    /// Resolves once the worker channel has terminated.
    pub async fn closed(&self) {
        self.protocol.closed().await;
    }
}

/// Update notifications for a single database id.
pub struct UpdateStream {
    database_id: u32,
    receiver: Option<broadcast::Receiver<UpdateNotification>>,
}

impl UpdateStream {
    /// Next update, or `None` once the connection has closed.
    pub async fn recv(&mut self) -> Option<UpdateNotification> {
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.recv().await {
                Ok(update) if update.database_id == self.database_id => return Some(update),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(database_id = self.database_id, skipped, "update subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.receiver = None;
                    return None;
                }
            }
        }
    }
}
