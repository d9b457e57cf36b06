//! Worker lifecycle: announce readiness, then serve until the coordinator
//! goes away.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use wdb_core::messages::{Envelope, Notification, NotificationPayload, ReadyNotification, WorkerKind};
use wdb_core::{Channel, ProtocolChannel, WdbResult};

use crate::config::WorkerEnvironment;
use crate::host::WorkerHost;

/// Serve one worker context over `channel`.
///
/// Sends the ready notification first, then answers requests in arrival
/// order and forwards row-change notifications. Returns once the channel has
/// terminated.
pub async fn serve(kind: WorkerKind, environment: WorkerEnvironment, mut channel: Channel) -> WdbResult<()> {
    channel
        .send(&Envelope::Notification(Notification {
            payload: NotificationPayload::Ready(ReadyNotification::new(kind)),
        }))
        .await?;

    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
    let host = Arc::new(WorkerHost::new(kind, environment, notify_tx));
    let protocol = ProtocolChannel::new(channel, host);
    info!(?kind, "worker ready");

    loop {
        tokio::select! {
            Some(notification) = notify_rx.recv() => {
                if protocol.notify(notification).is_err() {
                    debug!("channel gone, dropping update notification");
                    break;
                }
            }
            _ = protocol.closed() => break,
        }
    }

    info!(?kind, "worker stopped");
    Ok(())
}

/// Serve one worker context over the process's stdin and stdout.
pub async fn serve_stdio(kind: WorkerKind, environment: WorkerEnvironment) -> WdbResult<()> {
    let channel = wdb_core::framed(tokio::io::stdin(), tokio::io::stdout());
    serve(kind, environment, channel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use wdb_core::memory_pair;
    use wdb_core::messages::*;
    use wdb_core::Responder;

    struct Coordinator {
        updates: std::sync::Mutex<Vec<UpdateNotification>>,
    }

    impl Responder for Coordinator {
        fn handle_request(
            &self,
            _payload: RequestPayload,
        ) -> futures_util::future::BoxFuture<'_, WdbResult<ResponsePayload>> {
            Box::pin(async { Err(wdb_core::WdbError::NotImplemented("coordinator".into())) })
        }

        fn handle_notification(&self, notification: NotificationPayload) {
            if let NotificationPayload::Update(update) = notification {
                self.updates.lock().unwrap().push(update);
            }
        }
    }

    #[tokio::test]
    async fn announces_ready_then_serves() {
        let (worker_side, mut coordinator_side) = memory_pair();
        let worker = tokio::spawn(serve(
            WorkerKind::Dedicated,
            WorkerEnvironment::in_memory_only(),
            worker_side,
        ));

        match coordinator_side.recv().await.unwrap() {
            Some(Envelope::Notification(Notification {
                payload: NotificationPayload::Ready(ready),
            })) => {
                assert_eq!(ready.kind, WorkerKind::Dedicated);
                assert_eq!(ready.protocol_version, PROTOCOL_VERSION);
            }
            other => panic!("expected ready, got {other:?}"),
        }

        let coordinator = Arc::new(Coordinator {
            updates: std::sync::Mutex::new(Vec::new()),
        });
        let protocol = ProtocolChannel::new(coordinator_side, coordinator.clone());
        let opened = protocol
            .request(RequestPayload::OpenDatabase(OpenDatabasePayload {
                wasm_uri: String::new(),
                database_name: "app".into(),
                storage: StorageBackend::InMemory,
            }))
            .await
            .unwrap();
        let id = match opened {
            ResponsePayload::SimpleSuccess(Some(v)) => v.as_i64().unwrap() as u32,
            other => panic!("unexpected: {other:?}"),
        };

        protocol
            .request(RequestPayload::ToggleUpdateStream(ToggleUpdateStreamPayload {
                database_id: id,
                enable: true,
            }))
            .await
            .unwrap();
        for sql in ["CREATE TABLE t(x)", "INSERT INTO t VALUES (1)"] {
            protocol
                .request(RequestPayload::RunQuery(RunQueryPayload {
                    database_id: id,
                    sql: sql.into(),
                    parameters: vec![],
                    return_rows: false,
                }))
                .await
                .unwrap();
        }

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while coordinator.updates.lock().unwrap().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(coordinator.updates.lock().unwrap()[0].table, "t");

        protocol.close();
        worker.await.unwrap().unwrap();
    }
}
