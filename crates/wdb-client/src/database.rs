//! Handle to a database living inside a worker.

use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use wdb_core::messages::*;
use wdb_core::{RowSet, SqlValue, WdbError, WdbResult};

use crate::connection::{UpdateStream, WorkerConnection};

struct DatabaseInner {
    database_id: u32,
    connection: Arc<WorkerConnection>,
    /// `true` once disposed. Subscriptions watch it to complete.
    disposed: watch::Sender<bool>,
    /// Live update subscriptions. Held across the toggle request so start
    /// and stop reach the worker in transition order.
    subscribers: Mutex<usize>,
}

impl DatabaseInner {
    fn check_live(&self) -> WdbResult<()> {
        if *self.disposed.borrow() {
            return Err(WdbError::Disposed(self.database_id));
        }
        Ok(())
    }

    async fn toggle_updates(&self, enable: bool) -> WdbResult<()> {
        debug!(database_id = self.database_id, enable, "toggling update stream");
        self.connection
            .request(RequestPayload::ToggleUpdateStream(ToggleUpdateStreamPayload {
                database_id: self.database_id,
                enable,
            }))
            .await?;
        Ok(())
    }

    async fn release_subscription(&self) -> WdbResult<()> {
        let mut subscribers = self.subscribers.lock().await;
        if *subscribers == 0 {
            return Ok(());
        }
        *subscribers -= 1;
        let disposed = *self.disposed.borrow();
        if *subscribers == 0 && !disposed {
            self.toggle_updates(false).await?;
        }
        Ok(())
    }
}

/// A database opened in a worker, addressed by its worker-assigned id.
///
/// Cloning yields another handle to the same database; disposing through
/// any handle disposes all of them.
#[derive(Clone)]
pub struct RemoteDatabase {
    inner: Arc<DatabaseInner>,
}

impl RemoteDatabase {
    pub(crate) fn new(database_id: u32, connection: Arc<WorkerConnection>) -> Self {
        let (disposed, _) = watch::channel(false);
        Self {
            inner: Arc::new(DatabaseInner {
                database_id,
                connection,
                disposed,
                subscribers: Mutex::new(0),
            }),
        }
    }

    pub fn database_id(&self) -> u32 {
        self.inner.database_id
    }

    pub fn is_disposed(&self) -> bool {
        *self.inner.disposed.borrow()
    }

    /// Worker kind hosting this database.
    pub fn worker_kind(&self) -> WorkerKind {
        self.inner.connection.kind()
    }

    /// Run a statement, discarding any rows it produces.
    pub async fn execute(&self, sql: &str, parameters: Vec<SqlValue>) -> WdbResult<()> {
        self.run_query(sql, parameters, false).await?;
        Ok(())
    }

    /// Run a query and return its rows.
    pub async fn select(&self, sql: &str, parameters: Vec<SqlValue>) -> WdbResult<RowSet> {
        match self.run_query(sql, parameters, true).await? {
            ResponsePayload::Rows(rows) => Ok(rows),
            other => Err(WdbError::Protocol(format!(
                "expected a row set, got {:?}",
                other.kind()
            ))),
        }
    }

    /// Rowid of the most recent successful insert on this database.
    pub async fn last_insert_row_id(&self) -> WdbResult<i64> {
        let rows = self.select("SELECT last_insert_rowid()", vec![]).await?;
        single_integer(&rows)
    }

    pub async fn user_version(&self) -> WdbResult<i64> {
        let rows = self.select("PRAGMA user_version", vec![]).await?;
        single_integer(&rows)
    }

    pub async fn set_user_version(&self, version: i64) -> WdbResult<()> {
        // PRAGMA arguments cannot be bound; the value is an integer.
        self.execute(&format!("PRAGMA user_version = {version}"), vec![])
            .await
    }

    /// Subscribe to row changes in this database.
    ///
    /// The first live subscription turns the worker-side stream on; the last
    /// one to go away turns it off again.
    pub async fn updates(&self) -> WdbResult<UpdateSubscription> {
        self.inner.check_live()?;
        let mut subscribers = self.inner.subscribers.lock().await;
        self.inner.check_live()?;

        let stream = self.inner.connection.updates_for(self.inner.database_id);
        if *subscribers == 0 {
            self.inner.toggle_updates(true).await?;
        }
        *subscribers += 1;

        Ok(UpdateSubscription {
            inner: Some(self.inner.clone()),
            stream,
            disposed: self.inner.disposed.subscribe(),
        })
    }

    /// Close the database in the worker. Every later call on any handle,
    /// including another `dispose`, fails with [`WdbError::Disposed`].
    pub async fn dispose(&self) -> WdbResult<()> {
        if self.inner.disposed.send_replace(true) {
            return Err(WdbError::Disposed(self.inner.database_id));
        }
        *self.inner.subscribers.lock().await = 0;

        info!(database_id = self.inner.database_id, "disposing database");
        self.inner
            .connection
            .request(RequestPayload::CloseDatabase(CloseDatabasePayload {
                database_id: self.inner.database_id,
            }))
            .await?;
        Ok(())
    }

    async fn run_query(
        &self,
        sql: &str,
        parameters: Vec<SqlValue>,
        return_rows: bool,
    ) -> WdbResult<ResponsePayload> {
        self.inner.check_live()?;
        self.inner
            .connection
            .request(RequestPayload::RunQuery(RunQueryPayload {
                database_id: self.inner.database_id,
                sql: sql.to_string(),
                parameters,
                return_rows,
            }))
            .await
    }
}

impl std::fmt::Debug for RemoteDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteDatabase")
            .field("database_id", &self.inner.database_id)
            .field("worker_kind", &self.inner.connection.kind())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

fn single_integer(rows: &RowSet) -> WdbResult<i64> {
    rows.first_value()
        .and_then(SqlValue::as_i64)
        .ok_or_else(|| WdbError::Protocol("expected a single integer result".into()))
}

/// A live subscription to a database's row changes.
///
/// Completes when the database is disposed or its worker goes away.
/// Dropping it unsubscribes in the background.
pub struct UpdateSubscription {
    inner: Option<Arc<DatabaseInner>>,
    stream: UpdateStream,
    disposed: watch::Receiver<bool>,
}

impl UpdateSubscription {
    /// Next row change, or `None` once the subscription has completed.
    pub async fn recv(&mut self) -> Option<UpdateNotification> {
        self.inner.as_ref()?;
        let disposed = &mut self.disposed;
        tokio::select! {
            update = self.stream.recv() => update,
            _ = async { let _ = disposed.wait_for(|d| *d).await; } => None,
        }
    }

    /// Stop receiving updates and wait for the worker to be told, if this
    /// was the last subscription.
    pub async fn unsubscribe(mut self) -> WdbResult<()> {
        match self.inner.take() {
            Some(inner) => inner.release_subscription().await,
            None => Ok(()),
        }
    }
}

impl Drop for UpdateSubscription {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = inner.release_subscription().await {
                    debug!(database_id = inner.database_id, error = %e, "background unsubscribe failed");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use wdb_core::{memory_pair, ProtocolChannel, Responder};

    /// A worker that records every request and answers with canned replies.
    #[derive(Default)]
    struct FakeWorker {
        requests: StdMutex<Vec<RequestPayload>>,
        /// Replace every query response with a bare acknowledgement.
        ack_everything: bool,
    }

    impl FakeWorker {
        fn toggles(&self) -> Vec<bool> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter_map(|r| match r {
                    RequestPayload::ToggleUpdateStream(t) => Some(t.enable),
                    _ => None,
                })
                .collect()
        }

        fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    impl Responder for FakeWorker {
        fn handle_request(
            &self,
            payload: RequestPayload,
        ) -> futures_util::future::BoxFuture<'_, WdbResult<ResponsePayload>> {
            self.requests.lock().unwrap().push(payload.clone());
            let response = match payload {
                RequestPayload::RunQuery(q) if q.return_rows && !self.ack_everything => {
                    ResponsePayload::Rows(RowSet {
                        columns: vec!["v".into()],
                        rows: vec![vec![SqlValue::Integer(7)]],
                    })
                }
                _ => ResponsePayload::SimpleSuccess(None),
            };
            Box::pin(async move { Ok(response) })
        }

        fn handle_notification(&self, _notification: NotificationPayload) {}
    }

    async fn connected(worker: FakeWorker) -> (RemoteDatabase, Arc<FakeWorker>, ProtocolChannel) {
        let (coordinator_end, mut worker_end) = memory_pair();
        worker_end
            .send(&Envelope::Notification(Notification {
                payload: NotificationPayload::Ready(ReadyNotification::new(WorkerKind::Dedicated)),
            }))
            .await
            .unwrap();
        let connection = WorkerConnection::establish(
            WorkerKind::Dedicated,
            coordinator_end,
            Duration::from_secs(5),
            None,
        )
        .await
        .unwrap();
        let worker = Arc::new(worker);
        let worker_side = ProtocolChannel::new(worker_end, worker.clone());
        (RemoteDatabase::new(3, Arc::new(connection)), worker, worker_side)
    }

    async fn settle<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn subscription_toggles_follow_the_count() {
        let (db, worker, _w) = connected(FakeWorker::default()).await;

        let first = db.updates().await.unwrap();
        let second = db.updates().await.unwrap();
        assert_eq!(worker.toggles(), vec![true]);

        first.unsubscribe().await.unwrap();
        assert_eq!(worker.toggles(), vec![true]);
        second.unsubscribe().await.unwrap();
        assert_eq!(worker.toggles(), vec![true, false]);

        // Re-subscribing starts a fresh stream.
        let third = db.updates().await.unwrap();
        assert_eq!(worker.toggles(), vec![true, false, true]);
        drop(third);
        settle(|| worker.toggles().len() == 4).await;
        assert_eq!(worker.toggles(), vec![true, false, true, false]);
    }

    #[tokio::test]
    async fn select_rejects_a_bare_acknowledgement() {
        let (db, _worker, _w) = connected(FakeWorker {
            ack_everything: true,
            ..FakeWorker::default()
        })
        .await;
        let err = db.select("SELECT 1", vec![]).await.unwrap_err();
        assert!(err.is_protocol(), "got {err:?}");
    }

    #[tokio::test]
    async fn convenience_queries_read_the_first_value() {
        let (db, worker, _w) = connected(FakeWorker::default()).await;
        assert_eq!(db.user_version().await.unwrap(), 7);
        db.set_user_version(7).await.unwrap();
        let last = worker.requests.lock().unwrap().last().cloned();
        match last {
            Some(RequestPayload::RunQuery(q)) => {
                assert_eq!(q.sql, "PRAGMA user_version = 7");
                assert!(!q.return_rows);
            }
            other => panic!("unexpected request {other:?}"),
        };
    }

    #[tokio::test]
    async fn disposed_handles_fail_locally() {
        let (db, worker, _w) = connected(FakeWorker::default()).await;
        let mut updates = db.updates().await.unwrap();

        db.dispose().await.unwrap();
        assert!(db.is_disposed());
        assert!(updates.recv().await.is_none());
        let sent = worker.request_count();

        assert!(matches!(
            db.execute("SELECT 1", vec![]).await,
            Err(WdbError::Disposed(3))
        ));
        assert!(matches!(db.dispose().await, Err(WdbError::Disposed(3))));
        assert!(matches!(db.updates().await, Err(WdbError::Disposed(3))));
        drop(updates);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(worker.request_count(), sent);
        assert!(matches!(
            worker.requests.lock().unwrap().last(),
            Some(RequestPayload::CloseDatabase(CloseDatabasePayload { database_id: 3 }))
        ));
    }
}
