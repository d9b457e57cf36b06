//! The `wdb-worker` binary driven over its stdin and stdout.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::process::{Child, Command};

use wdb_core::messages::*;
use wdb_core::{framed, ProtocolChannel, Responder, WdbError, WdbResult};

/// Coordinator side that ignores whatever the worker sends unprompted.
struct Quiet;

impl Responder for Quiet {
    fn handle_request(&self, _payload: RequestPayload) -> BoxFuture<'_, WdbResult<ResponsePayload>> {
        Box::pin(async { Err(WdbError::NotImplemented("coordinator".into())) })
    }

    fn handle_notification(&self, _notification: NotificationPayload) {}
}

/// Start the worker binary and wait for its ready notification.
async fn start_worker(kind: WorkerKind) -> (Child, ProtocolChannel) {
    let kind_arg = match kind {
        WorkerKind::Dedicated => "dedicated",
        WorkerKind::Shared => "shared",
    };
    let mut child = Command::new(env!("CARGO_BIN_EXE_wdb-worker"))
        .args(["--kind", kind_arg, "--profile", "/nonexistent/wdb-worker.toml"])
        .args(["--log-level", "warn"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .unwrap();

    let stdin = child.stdin.take().unwrap();
    let stdout = child.stdout.take().unwrap();
    let mut channel = framed(stdout, stdin);

    let first = tokio::time::timeout(Duration::from_secs(10), channel.recv())
        .await
        .unwrap()
        .unwrap();
    match first {
        Some(Envelope::Notification(Notification {
            payload: NotificationPayload::Ready(ready),
        })) => {
            assert_eq!(ready.protocol_version, PROTOCOL_VERSION);
            assert_eq!(ready.kind, kind);
        }
        other => panic!("expected ready notification, got {other:?}"),
    }

    (child, ProtocolChannel::new(channel, Arc::new(Quiet)))
}

async fn open_in_memory(protocol: &ProtocolChannel) -> u32 {
    let response = protocol
        .request(RequestPayload::OpenDatabase(OpenDatabasePayload {
            wasm_uri: String::new(),
            database_name: "scratch".into(),
            storage: StorageBackend::InMemory,
        }))
        .await
        .unwrap();
    match response {
        ResponsePayload::SimpleSuccess(Some(SqlValue::Integer(id))) => id as u32,
        other => panic!("unexpected open response: {other:?}"),
    }
}

fn query(database_id: u32, sql: &str) -> RequestPayload {
    RequestPayload::RunQuery(RunQueryPayload {
        database_id,
        sql: sql.into(),
        parameters: vec![],
        return_rows: true,
    })
}

#[tokio::test]
async fn queries_round_trip_through_the_process() {
    let (mut child, protocol) = start_worker(WorkerKind::Dedicated).await;
    let id = open_in_memory(&protocol).await;

    match protocol.request(query(id, "SELECT 1")).await.unwrap() {
        ResponsePayload::Rows(rows) => {
            assert_eq!(rows.rows, vec![vec![SqlValue::Integer(1)]]);
        }
        other => panic!("unexpected response: {other:?}"),
    }

    match protocol.request(query(id, "SELECT * FROM nowhere")).await {
        Err(WdbError::Engine(message)) => assert_eq!(message, "no such table: nowhere"),
        other => panic!("expected engine error, got {other:?}"),
    }

    protocol.close();
    let status = tokio::time::timeout(Duration::from_secs(10), child.wait())
        .await
        .unwrap()
        .unwrap();
    assert!(status.success());
}

#[tokio::test]
async fn killing_the_worker_fails_pending_requests() {
    let (mut child, protocol) = start_worker(WorkerKind::Shared).await;
    let protocol = Arc::new(protocol);
    let id = open_in_memory(&protocol).await;

    // Never finishes, so the request is still pending when the process dies.
    let endless = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) \
                   SELECT count(*) FROM c";
    let pending = {
        let protocol = protocol.clone();
        tokio::spawn(async move { protocol.request(query(id, endless)).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!pending.is_finished());

    child.kill().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(10), pending)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(WdbError::ConnectionClosed)));

    tokio::time::timeout(Duration::from_secs(10), protocol.closed())
        .await
        .unwrap();
    assert!(protocol.is_closed());
    assert!(matches!(
        protocol.request(query(id, "SELECT 1")).await,
        Err(WdbError::ConnectionClosed)
    ));
}
