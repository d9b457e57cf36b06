//! Session lifecycle management.
//!
//! Starts the worker contexts once, checks what they can do, and opens
//! databases inside them.

use std::sync::Arc;

use futures_util::future::try_join;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use wdb_core::messages::*;
use wdb_core::{WdbError, WdbResult, WorkerSpawner};

use crate::config::SessionConfig;
use crate::connection::WorkerConnection;
use crate::database::RemoteDatabase;

/// Outcome of feature detection across the live workers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureReport {
    /// Sorted, without duplicates.
    pub missing_features: Vec<MissingFeature>,
    /// Databases already present in persistent storage, sorted.
    pub existing_databases: Vec<String>,
}

impl FeatureReport {
    pub fn is_missing(&self, feature: MissingFeature) -> bool {
        self.missing_features.contains(&feature)
    }

    /// Best persistent backend available, falling back to memory.
    pub fn preferred_storage(&self) -> StorageBackend {
        if !self.is_missing(MissingFeature::FileSystemAccess) {
            StorageBackend::FileSystem
        } else if !self.is_missing(MissingFeature::IndexedDb) {
            StorageBackend::IndexedDb
        } else {
            StorageBackend::InMemory
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartState {
    NotStarted,
    Starting,
    Started,
    StartFailed,
}

/// Worker connections established by a successful start.
#[derive(Clone, Default)]
struct Workers {
    dedicated: Option<Arc<WorkerConnection>>,
    shared: Option<Arc<WorkerConnection>>,
}

impl Workers {
    fn get(&self, kind: WorkerKind) -> Option<&Arc<WorkerConnection>> {
        match kind {
            WorkerKind::Dedicated => self.dedicated.as_ref(),
            WorkerKind::Shared => self.shared.as_ref(),
        }
    }
}

struct StartGate {
    state: StartState,
    workers: Workers,
    missing_kinds: Vec<WorkerKind>,
    failure: Option<String>,
}

/// Owns the worker contexts of one coordinator.
pub struct SessionManager {
    spawner: Arc<dyn WorkerSpawner>,
    config: SessionConfig,
    gate: Mutex<StartGate>,
}

impl SessionManager {
    pub fn new(spawner: Arc<dyn WorkerSpawner>, config: SessionConfig) -> Self {
        Self {
            spawner,
            config,
            gate: Mutex::new(StartGate {
                state: StartState::NotStarted,
                workers: Workers::default(),
                missing_kinds: Vec::new(),
                failure: None,
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Spawn and handshake both worker kinds, once.
    ///
    /// Concurrent callers wait for the same start. A failed start is final:
    /// every later call reports the same failure.
    pub async fn ensure_started(&self) -> WdbResult<()> {
        self.started_workers().await.map(|_| ())
    }

    pub async fn is_started(&self) -> bool {
        self.gate.lock().await.state == StartState::Started
    }

    /// Worker kinds the environment could not provide. Empty before start.
    pub async fn missing_worker_kinds(&self) -> Vec<WorkerKind> {
        self.gate.lock().await.missing_kinds.clone()
    }

    /// Ask every live worker what it supports and merge the answers.
    pub async fn detect_features(&self, database_name: Option<&str>) -> WdbResult<FeatureReport> {
        let workers = self.started_workers().await?;
        let missing_kinds = self.missing_worker_kinds().await;
        let check = CompatibilityCheckPayload {
            database_name: database_name.map(str::to_string),
        };

        let dedicated = async {
            match &workers.dedicated {
                Some(conn) => compatibility(conn, check.clone()).await.map(Some),
                None => Ok(None),
            }
        };
        let shared = async {
            match &workers.shared {
                Some(conn) => compatibility(conn, check.clone()).await.map(Some),
                None => Ok(None),
            }
        };
        let (dedicated, shared) = try_join(dedicated, shared).await?;

        let report = merge_reports(&missing_kinds, dedicated.as_ref(), shared.as_ref());
        debug!(
            missing = ?report.missing_features,
            existing = report.existing_databases.len(),
            "feature detection finished"
        );
        Ok(report)
    }

    /// Open `database_name` with `storage` in the worker selected by `access`.
    pub async fn connect(
        &self,
        database_name: &str,
        storage: StorageBackend,
        access: AccessMode,
    ) -> WdbResult<RemoteDatabase> {
        let workers = self.started_workers().await?;
        let kind = access.worker_kind();
        let connection = workers
            .get(kind)
            .cloned()
            .ok_or(WdbError::MissingFeature(kind.missing_feature()))?;

        let response = connection
            .request(RequestPayload::OpenDatabase(OpenDatabasePayload {
                wasm_uri: self.config.wasm_uri.clone(),
                database_name: database_name.to_string(),
                storage,
            }))
            .await?;
        let database_id = match response {
            ResponsePayload::SimpleSuccess(Some(value)) => value
                .as_i64()
                .and_then(|id| u32::try_from(id).ok())
                .ok_or_else(|| {
                    WdbError::Protocol(format!("open returned a non-integer id: {value:?}"))
                })?,
            other => {
                return Err(WdbError::Protocol(format!(
                    "open returned no database id ({:?})",
                    other.kind()
                )))
            }
        };

        info!(database_id, name = database_name, ?storage, ?kind, "database connected");
        Ok(RemoteDatabase::new(database_id, connection))
    }

    /// Open `database_name` with the best storage its hosting worker
    /// offers, preferring the dedicated worker.
    pub async fn open(&self, database_name: &str) -> WdbResult<RemoteDatabase> {
        let workers = self.started_workers().await?;
        let (access, host) = match (&workers.dedicated, &workers.shared) {
            (Some(conn), _) => (AccessMode::DedicatedWorker, conn),
            (None, Some(conn)) => (AccessMode::SharedWorker, conn),
            (None, None) => return Err(WdbError::MissingFeature(MissingFeature::DedicatedWorkers)),
        };
        let result = compatibility(
            host,
            CompatibilityCheckPayload {
                database_name: Some(database_name.to_string()),
            },
        )
        .await?;
        self.connect(database_name, storage_for(&result), access)
            .await
    }

    // ── Internal ─────────────────────────────────────────────────────

    async fn started_workers(&self) -> WdbResult<Workers> {
        let mut gate = self.gate.lock().await;
        match gate.state {
            StartState::Started => return Ok(gate.workers.clone()),
            StartState::StartFailed => {
                let message = gate.failure.clone().unwrap_or_default();
                return Err(WdbError::StartFailed(message));
            }
            // A `Starting` state seen while holding the gate means the
            // previous starter was cancelled mid-way; start over.
            StartState::NotStarted | StartState::Starting => {}
        }

        gate.state = StartState::Starting;
        info!("starting workers");
        let started = try_join(
            self.start_worker(WorkerKind::Dedicated),
            self.start_worker(WorkerKind::Shared),
        )
        .await;

        match started {
            Ok((dedicated, shared)) => {
                gate.missing_kinds.clear();
                if dedicated.is_none() {
                    gate.missing_kinds.push(WorkerKind::Dedicated);
                }
                if shared.is_none() {
                    gate.missing_kinds.push(WorkerKind::Shared);
                }
                gate.workers = Workers { dedicated, shared };
                gate.state = StartState::Started;
                info!(missing = ?gate.missing_kinds, "workers started");
                Ok(gate.workers.clone())
            }
            Err(e) => {
                warn!(error = %e, "worker start failed");
                let message = e.to_string();
                gate.failure = Some(message.clone());
                gate.state = StartState::StartFailed;
                Err(WdbError::StartFailed(message))
            }
        }
    }

    async fn start_worker(&self, kind: WorkerKind) -> WdbResult<Option<Arc<WorkerConnection>>> {
        let Some(channel) = self.spawner.spawn(kind).await? else {
            info!(?kind, "worker kind unavailable");
            return Ok(None);
        };
        let connection = WorkerConnection::establish(
            kind,
            channel,
            self.config.handshake_timeout(),
            self.config.request_timeout(),
        )
        .await?;
        Ok(Some(Arc::new(connection)))
    }
}

fn unexpected(expected: MsgKind, actual: &ResponsePayload) -> WdbError {
    WdbError::UnexpectedResponse {
        expected,
        actual: actual.kind(),
    }
}

/// Ask one worker what it supports, using the check for its kind.
async fn compatibility(
    conn: &WorkerConnection,
    check: CompatibilityCheckPayload,
) -> WdbResult<CompatibilityResult> {
    let (request, expected) = match conn.kind() {
        WorkerKind::Dedicated => (
            RequestPayload::DedicatedCompatibilityCheck(check),
            MsgKind::DedicatedCompatibilityCheck,
        ),
        WorkerKind::Shared => (
            RequestPayload::SharedCompatibilityCheck(check),
            MsgKind::SharedCompatibilityCheck,
        ),
    };
    match conn.request(request).await? {
        ResponsePayload::DedicatedCompatibility(result)
        | ResponsePayload::SharedCompatibility(result) => Ok(result),
        other => Err(unexpected(expected, &other)),
    }
}

/// Best backend one worker can open, falling back to memory.
fn storage_for(result: &CompatibilityResult) -> StorageBackend {
    if result.can_use_file_system {
        StorageBackend::FileSystem
    } else if result.can_use_indexed_db {
        StorageBackend::IndexedDb
    } else {
        StorageBackend::InMemory
    }
}

/// A capability is missing only when no live worker reports it.
fn merge_reports(
    missing_kinds: &[WorkerKind],
    dedicated: Option<&CompatibilityResult>,
    shared: Option<&CompatibilityResult>,
) -> FeatureReport {
    let live: Vec<&CompatibilityResult> = dedicated.into_iter().chain(shared).collect();
    let mut missing: Vec<MissingFeature> =
        missing_kinds.iter().map(|k| k.missing_feature()).collect();

    if !live.iter().any(|r| r.can_use_file_system) {
        missing.push(MissingFeature::FileSystemAccess);
    }
    if !live.iter().any(|r| r.can_use_indexed_db) {
        missing.push(MissingFeature::IndexedDb);
    }
    if !live.iter().any(|r| r.supports_shared_memory) {
        missing.push(MissingFeature::SharedMemory);
    }
    if let Some(shared) = shared {
        if !shared.shared_can_spawn_dedicated {
            missing.push(MissingFeature::DedicatedWorkersInSharedWorkers);
        }
    }
    missing.sort();
    missing.dedup();

    let mut existing: Vec<String> = live
        .iter()
        .flat_map(|r| r.existing_databases.iter().cloned())
        .collect();
    existing.sort();
    existing.dedup();

    FeatureReport {
        missing_features: missing,
        existing_databases: existing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wdb_core::Channel;
    use wdb_worker::{EnvironmentProfile, LocalSpawner, WorkerEnvironment};

    /// Counts spawns per kind and delegates to an in-process spawner.
    struct CountingSpawner {
        inner: LocalSpawner,
        dedicated: AtomicUsize,
        shared: AtomicUsize,
        fail: bool,
    }

    impl CountingSpawner {
        fn new(profile: EnvironmentProfile) -> Self {
            Self {
                inner: LocalSpawner::new(profile),
                dedicated: AtomicUsize::new(0),
                shared: AtomicUsize::new(0),
                fail: false,
            }
        }
    }

    impl WorkerSpawner for CountingSpawner {
        fn spawn(&self, kind: WorkerKind) -> BoxFuture<'_, WdbResult<Option<Channel>>> {
            match kind {
                WorkerKind::Dedicated => self.dedicated.fetch_add(1, Ordering::SeqCst),
                WorkerKind::Shared => self.shared.fetch_add(1, Ordering::SeqCst),
            };
            Box::pin(async move {
                tokio::task::yield_now().await;
                if self.fail {
                    return Err(WdbError::Transport("spawn refused".into()));
                }
                self.inner.spawn(kind).await
            })
        }
    }

    /// Gives each worker kind its own environment.
    struct SplitSpawner {
        dedicated: LocalSpawner,
        shared: LocalSpawner,
    }

    impl WorkerSpawner for SplitSpawner {
        fn spawn(&self, kind: WorkerKind) -> BoxFuture<'_, WdbResult<Option<Channel>>> {
            match kind {
                WorkerKind::Dedicated => self.dedicated.spawn(kind),
                WorkerKind::Shared => self.shared.spawn(kind),
            }
        }
    }

    fn manager(spawner: Arc<CountingSpawner>) -> SessionManager {
        SessionManager::new(spawner, SessionConfig::default())
    }

    #[tokio::test]
    async fn concurrent_starts_spawn_once_per_kind() {
        let spawner = Arc::new(CountingSpawner::new(EnvironmentProfile::default()));
        let manager = Arc::new(manager(spawner.clone()));

        let starts: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.ensure_started().await })
            })
            .collect();
        for start in starts {
            start.await.unwrap().unwrap();
        }

        assert!(manager.is_started().await);
        assert_eq!(spawner.dedicated.load(Ordering::SeqCst), 1);
        assert_eq!(spawner.shared.load(Ordering::SeqCst), 1);
        assert!(manager.missing_worker_kinds().await.is_empty());
    }

    #[tokio::test]
    async fn start_failure_is_sticky() {
        let mut spawner = CountingSpawner::new(EnvironmentProfile::default());
        spawner.fail = true;
        let spawner = Arc::new(spawner);
        let manager = manager(spawner.clone());

        let first = manager.ensure_started().await.unwrap_err();
        let second = manager.ensure_started().await.unwrap_err();
        match (first, second) {
            (WdbError::StartFailed(a), WdbError::StartFailed(b)) => assert_eq!(a, b),
            other => panic!("unexpected errors: {other:?}"),
        }
        assert!(!manager.is_started().await);
        assert!(matches!(
            manager.connect("app", StorageBackend::InMemory, AccessMode::default()).await,
            Err(WdbError::StartFailed(_))
        ));
        assert_eq!(spawner.dedicated.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_start_failures_agree() {
        let mut spawner = CountingSpawner::new(EnvironmentProfile::default());
        spawner.fail = true;
        let spawner = Arc::new(spawner);
        let manager = Arc::new(manager(spawner.clone()));

        let starts: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.ensure_started().await })
            })
            .collect();
        let mut messages = Vec::new();
        for start in starts {
            match start.await.unwrap() {
                Err(WdbError::StartFailed(message)) => messages.push(message),
                other => panic!("expected a start failure, got {other:?}"),
            }
        }

        assert_eq!(messages.len(), 8);
        assert!(messages.iter().all(|m| m == &messages[0]));
        assert!(messages[0].contains("spawn refused"));
        assert_eq!(spawner.dedicated.load(Ordering::SeqCst), 1);
        assert_eq!(spawner.shared.load(Ordering::SeqCst), 1);
        assert!(!manager.is_started().await);
    }

    #[tokio::test]
    async fn dedicated_only_detection() {
        let spawner = Arc::new(CountingSpawner::new(EnvironmentProfile {
            shared_workers: false,
            ..EnvironmentProfile::default()
        }));
        let manager = manager(spawner);

        let report = manager.detect_features(None).await.unwrap();
        assert!(report.is_missing(MissingFeature::SharedWorkers));
        assert!(!report.is_missing(MissingFeature::DedicatedWorkers));
        assert!(!report.is_missing(MissingFeature::DedicatedWorkersInSharedWorkers));
        assert_eq!(manager.missing_worker_kinds().await, vec![WorkerKind::Shared]);

        let err = manager
            .connect("app", StorageBackend::InMemory, AccessMode::SharedWorker)
            .await
            .unwrap_err();
        assert!(matches!(err, WdbError::MissingFeature(MissingFeature::SharedWorkers)));
    }

    #[tokio::test]
    async fn shared_worker_without_nesting_is_reported() {
        let spawner = Arc::new(CountingSpawner::new(EnvironmentProfile::default()));
        let report = manager(spawner).detect_features(None).await.unwrap();
        assert!(report.is_missing(MissingFeature::DedicatedWorkersInSharedWorkers));
        // No storage root: only memory is usable.
        assert!(report.is_missing(MissingFeature::FileSystemAccess));
        assert!(report.is_missing(MissingFeature::IndexedDb));
        assert_eq!(report.preferred_storage(), StorageBackend::InMemory);
    }

    #[test]
    fn capabilities_are_missing_only_if_no_worker_has_them() {
        let dedicated = CompatibilityResult {
            existing_databases: vec!["b".into(), "a".into()],
            can_use_indexed_db: true,
            ..CompatibilityResult::default()
        };
        let shared = CompatibilityResult {
            existing_databases: vec!["a".into()],
            can_use_file_system: true,
            supports_shared_memory: true,
            shared_can_spawn_dedicated: true,
            ..CompatibilityResult::default()
        };
        let report = merge_reports(&[], Some(&dedicated), Some(&shared));
        assert!(report.missing_features.is_empty());
        assert_eq!(report.existing_databases, vec!["a", "b"]);
        assert_eq!(report.preferred_storage(), StorageBackend::FileSystem);

        let report = merge_reports(&[WorkerKind::Shared], Some(&dedicated), None);
        assert_eq!(
            report.missing_features,
            vec![
                MissingFeature::SharedWorkers,
                MissingFeature::FileSystemAccess,
                MissingFeature::SharedMemory,
            ]
        );
        assert_eq!(report.preferred_storage(), StorageBackend::IndexedDb);
    }

    #[tokio::test]
    async fn open_prefers_persistent_storage() {
        let root = tempfile::tempdir().unwrap();
        let spawner = Arc::new(CountingSpawner::new(EnvironmentProfile {
            environment: WorkerEnvironment {
                shared_memory: false,
                ..WorkerEnvironment::default()
            }
            .with_storage_root(root.path()),
            ..EnvironmentProfile::default()
        }));
        let manager = manager(spawner);

        let db = manager.open("notes").await.unwrap();
        db.execute("CREATE TABLE t(x)", vec![]).await.unwrap();
        assert!(root.path().join("idb/notes.sqlite").exists());

        let report = manager.detect_features(Some("notes")).await.unwrap();
        assert_eq!(report.existing_databases, vec!["notes"]);
    }

    #[tokio::test]
    async fn open_uses_the_hosting_workers_storage() {
        let root = tempfile::tempdir().unwrap();
        // Only the shared worker can reach the file system.
        let dedicated = EnvironmentProfile {
            environment: WorkerEnvironment {
                shared_memory: false,
                ..WorkerEnvironment::default()
            }
            .with_storage_root(root.path()),
            ..EnvironmentProfile::default()
        };
        let shared = EnvironmentProfile {
            environment: WorkerEnvironment::default().with_storage_root(root.path()),
            ..EnvironmentProfile::default()
        };
        let manager = SessionManager::new(
            Arc::new(SplitSpawner {
                dedicated: LocalSpawner::new(dedicated),
                shared: LocalSpawner::new(shared),
            }),
            SessionConfig::default(),
        );

        let report = manager.detect_features(None).await.unwrap();
        assert_eq!(report.preferred_storage(), StorageBackend::FileSystem);

        let db = manager.open("ledger").await.unwrap();
        db.execute("CREATE TABLE t(x)", vec![]).await.unwrap();
        assert!(root.path().join("idb/ledger.sqlite").exists());
        assert!(!root.path().join("fs/ledger.sqlite").exists());
    }
}
