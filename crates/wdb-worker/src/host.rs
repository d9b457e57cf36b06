//! The responder side of a worker: owns open databases and serves requests.
//!
//! Each open database gets an id minted here, starting at 1, that only means
//! something on this worker's channel. Queries run on the blocking pool since
//! SQLite calls are synchronous.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use rusqlite::hooks::Action;
use rusqlite::{params_from_iter, Connection};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use wdb_core::messages::*;
use wdb_core::{Responder, WdbError, WdbResult};

use crate::config::WorkerEnvironment;
use crate::values::{from_sqlite, to_sqlite};

/// One database opened on behalf of the coordinator.
struct HostedDatabase {
    name: String,
    storage: StorageBackend,
    connection: Arc<Mutex<Connection>>,
    /// Whether row changes are pushed to the coordinator.
    streaming: Arc<AtomicBool>,
}

/// Serves protocol requests for one worker context.
pub struct WorkerHost {
    kind: WorkerKind,
    environment: WorkerEnvironment,
    databases: Mutex<HashMap<u32, Arc<HostedDatabase>>>,
    next_id: AtomicU32,
    notifications: mpsc::UnboundedSender<NotificationPayload>,
}

impl WorkerHost {
    /// Create a host. Update notifications are emitted on `notifications`.
    pub fn new(
        kind: WorkerKind,
        environment: WorkerEnvironment,
        notifications: mpsc::UnboundedSender<NotificationPayload>,
    ) -> Self {
        Self {
            kind,
            environment,
            databases: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            notifications,
        }
    }

    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    /// Number of currently open databases.
    pub fn open_databases(&self) -> usize {
        self.lock_databases().len()
    }

    fn lock_databases(&self) -> std::sync::MutexGuard<'_, HashMap<u32, Arc<HostedDatabase>>> {
        // A poisoned map only means a panic elsewhere; the entries are still valid.
        self.databases.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn database(&self, id: u32) -> WdbResult<Arc<HostedDatabase>> {
        self.lock_databases()
            .get(&id)
            .cloned()
            .ok_or_else(|| WdbError::Engine(format!("unknown database id {id}")))
    }

    async fn open(&self, payload: OpenDatabasePayload) -> WdbResult<ResponsePayload> {
        let OpenDatabasePayload {
            wasm_uri,
            database_name,
            storage,
        } = payload;

        if !self.environment.can_use(storage) {
            return Err(WdbError::Engine(format!(
                "storage backend {storage:?} is not available in this worker"
            )));
        }
        let path = match storage {
            StorageBackend::InMemory => None,
            backend => Some(self.environment.database_path(backend, &database_name)?),
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let streaming = Arc::new(AtomicBool::new(false));
        let hook = UpdateHook {
            database_id: id,
            streaming: streaming.clone(),
            notifications: self.notifications.clone(),
        };

        let connection = tokio::task::spawn_blocking(move || -> WdbResult<Connection> {
            let connection = match path {
                Some(path) => {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    Connection::open(path).map_err(engine)?
                }
                None => Connection::open_in_memory().map_err(engine)?,
            };
            connection.update_hook(Some(move |action: Action, _db: &str, table: &str, rowid: i64| {
                hook.fire(action, table, rowid)
            }));
            Ok(connection)
        })
        .await
        .map_err(|e| WdbError::Other(format!("open task failed: {e}")))??;

        info!(
            database_id = id,
            name = %database_name,
            ?storage,
            wasm_uri = %wasm_uri,
            "database opened"
        );
        self.lock_databases().insert(
            id,
            Arc::new(HostedDatabase {
                name: database_name,
                storage,
                connection: Arc::new(Mutex::new(connection)),
                streaming,
            }),
        );

        Ok(ResponsePayload::SimpleSuccess(Some(SqlValue::Integer(
            id as i64,
        ))))
    }

    async fn run_query(&self, payload: RunQueryPayload) -> WdbResult<ResponsePayload> {
        let RunQueryPayload {
            database_id,
            sql,
            parameters,
            return_rows,
        } = payload;
        let database = self.database(database_id)?;
        let connection = database.connection.clone();

        tokio::task::spawn_blocking(move || {
            let connection = connection.lock().unwrap_or_else(|e| e.into_inner());
            run_statement(&connection, &sql, parameters, return_rows)
        })
        .await
        .map_err(|e| WdbError::Other(format!("query task failed: {e}")))?
    }

    fn close(&self, payload: CloseDatabasePayload) -> WdbResult<ResponsePayload> {
        let removed = self.lock_databases().remove(&payload.database_id);
        match removed {
            Some(database) => {
                database.streaming.store(false, Ordering::SeqCst);
                info!(
                    database_id = payload.database_id,
                    name = %database.name,
                    storage = ?database.storage,
                    "database closed"
                );
                Ok(ResponsePayload::SimpleSuccess(None))
            }
            None => Err(WdbError::Engine(format!(
                "unknown database id {}",
                payload.database_id
            ))),
        }
    }

    fn toggle_updates(&self, payload: ToggleUpdateStreamPayload) -> WdbResult<ResponsePayload> {
        let database = self.database(payload.database_id)?;
        database.streaming.store(payload.enable, Ordering::SeqCst);
        debug!(
            database_id = payload.database_id,
            enable = payload.enable,
            "update stream toggled"
        );
        Ok(ResponsePayload::SimpleSuccess(None))
    }

    fn compatibility(&self, payload: &CompatibilityCheckPayload) -> WdbResult<CompatibilityResult> {
        self.environment
            .compatibility(self.kind, payload.database_name.as_deref())
    }
}

impl Responder for WorkerHost {
    fn handle_request(&self, payload: RequestPayload) -> BoxFuture<'_, WdbResult<ResponsePayload>> {
        Box::pin(async move {
            match payload {
                RequestPayload::OpenDatabase(p) => self.open(p).await,
                RequestPayload::RunQuery(p) => self.run_query(p).await,
                RequestPayload::CloseDatabase(p) => self.close(p),
                RequestPayload::ToggleUpdateStream(p) => self.toggle_updates(p),
                RequestPayload::DedicatedCompatibilityCheck(p) => self
                    .compatibility(&p)
                    .map(ResponsePayload::DedicatedCompatibility),
                RequestPayload::SharedCompatibilityCheck(p) => self
                    .compatibility(&p)
                    .map(ResponsePayload::SharedCompatibility),
            }
        })
    }

    fn handle_notification(&self, notification: NotificationPayload) {
        debug!(kind = ?notification.kind(), "ignoring notification from coordinator");
    }

    fn on_closed(&self) {
        let mut databases = self.lock_databases();
        if !databases.is_empty() {
            warn!(
                count = databases.len(),
                "coordinator went away, dropping open databases"
            );
        }
        databases.clear();
    }
}

/// Forwards SQLite row changes while streaming is enabled.
struct UpdateHook {
    database_id: u32,
    streaming: Arc<AtomicBool>,
    notifications: mpsc::UnboundedSender<NotificationPayload>,
}

impl UpdateHook {
    fn fire(&self, action: Action, table: &str, rowid: i64) {
        if !self.streaming.load(Ordering::SeqCst) {
            return;
        }
        let kind = match action {
            Action::SQLITE_INSERT => UpdateKind::Insert,
            Action::SQLITE_UPDATE => UpdateKind::Update,
            Action::SQLITE_DELETE => UpdateKind::Delete,
            _ => return,
        };
        let _ = self
            .notifications
            .send(NotificationPayload::Update(UpdateNotification {
                database_id: self.database_id,
                table: table.to_string(),
                rowid,
                kind,
            }));
    }
}

fn engine(e: rusqlite::Error) -> WdbError {
    WdbError::Engine(e.to_string())
}

/// Run one statement. Without `return_rows` any produced rows are drained
/// and discarded.
fn run_statement(
    connection: &Connection,
    sql: &str,
    parameters: Vec<SqlValue>,
    return_rows: bool,
) -> WdbResult<ResponsePayload> {
    if !return_rows && parameters.is_empty() {
        connection.execute_batch(sql).map_err(engine)?;
        return Ok(ResponsePayload::SimpleSuccess(None));
    }

    let mut statement = connection.prepare(sql).map_err(engine)?;
    let columns: Vec<String> = statement
        .column_names()
        .into_iter()
        .map(str::to_string)
        .collect();
    let values = parameters.into_iter().map(to_sqlite);
    let mut rows = statement.query(params_from_iter(values)).map_err(engine)?;

    if !return_rows {
        while rows.next().map_err(engine)?.is_some() {}
        return Ok(ResponsePayload::SimpleSuccess(None));
    }

    let mut result = RowSet {
        columns,
        rows: Vec::new(),
    };
    while let Some(row) = rows.next().map_err(engine)? {
        let mut values = Vec::with_capacity(result.columns.len());
        for index in 0..result.columns.len() {
            values.push(from_sqlite(row.get_ref(index).map_err(engine)?));
        }
        result.rows.push(values);
    }
    Ok(ResponsePayload::Rows(result))
}
