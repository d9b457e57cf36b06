//! Worker environment configuration: TOML file + CLI overrides.
//!
//! The environment describes what a worker context can reach (storage
//! backends, shared memory, nested workers). The profile adds which worker
//! kinds exist at all and how in-process workers are connected.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;
use wdb_core::messages::{CompatibilityResult, StorageBackend, WorkerKind};
use wdb_core::{WdbError, WdbResult};

/// File extension of databases stored by persistent backends.
const DATABASE_EXTENSION: &str = "sqlite";

/// Capabilities visible from inside one worker context.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerEnvironment {
    #[serde(default = "default_true")]
    pub file_system_access: bool,
    #[serde(default = "default_true")]
    pub indexed_db: bool,
    #[serde(default = "default_true")]
    pub shared_memory: bool,
    /// Whether a shared worker may start dedicated workers of its own.
    #[serde(default)]
    pub nested_workers: bool,
    /// Directory holding persistent databases. Without it only in-memory
    /// databases can be opened.
    #[serde(default)]
    pub storage_root: Option<PathBuf>,
}

impl Default for WorkerEnvironment {
    fn default() -> Self {
        Self {
            file_system_access: true,
            indexed_db: true,
            shared_memory: true,
            nested_workers: false,
            storage_root: None,
        }
    }
}

impl WorkerEnvironment {
    /// An environment with no persistent storage at all.
    pub fn in_memory_only() -> Self {
        Self {
            file_system_access: false,
            indexed_db: false,
            shared_memory: false,
            nested_workers: false,
            storage_root: None,
        }
    }

    pub fn with_storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage_root = Some(root.into());
        self
    }

    /// Whether databases can be opened with `backend` here.
    pub fn can_use(&self, backend: StorageBackend) -> bool {
        match backend {
            StorageBackend::InMemory => true,
            StorageBackend::FileSystem => {
                self.storage_root.is_some() && self.file_system_access && self.shared_memory
            }
            StorageBackend::IndexedDb => self.storage_root.is_some() && self.indexed_db,
        }
    }

    /// Directory a persistent backend keeps its databases in.
    pub fn backend_dir(&self, backend: StorageBackend) -> Option<PathBuf> {
        let root = self.storage_root.as_ref()?;
        match backend {
            StorageBackend::InMemory => None,
            StorageBackend::FileSystem => Some(root.join("fs")),
            StorageBackend::IndexedDb => Some(root.join("idb")),
        }
    }

    /// Path of the database file `name` under `backend`.
    pub fn database_path(&self, backend: StorageBackend, name: &str) -> WdbResult<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(WdbError::Engine(format!("invalid database name: {name:?}")));
        }
        let dir = self.backend_dir(backend).ok_or_else(|| {
            WdbError::Engine(format!("storage backend {backend:?} has no location"))
        })?;
        Ok(dir.join(format!("{name}.{DATABASE_EXTENSION}")))
    }

    /// Names of databases already present in usable persistent backends,
    /// sorted and de-duplicated. With `only`, at most that one name.
    pub fn existing_databases(&self, only: Option<&str>) -> WdbResult<Vec<String>> {
        let mut names = Vec::new();

        for backend in [StorageBackend::FileSystem, StorageBackend::IndexedDb] {
            if !self.can_use(backend) {
                continue;
            }
            let Some(dir) = self.backend_dir(backend) else {
                continue;
            };
            if !dir.exists() {
                continue;
            }
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some(DATABASE_EXTENSION) {
                    continue;
                }
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    if only.map_or(true, |wanted| wanted == stem) {
                        names.push(stem.to_string());
                    }
                }
            }
        }

        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Answer a compatibility check as a worker of `kind`.
    pub fn compatibility(
        &self,
        kind: WorkerKind,
        database_name: Option<&str>,
    ) -> WdbResult<CompatibilityResult> {
        Ok(CompatibilityResult {
            existing_databases: self.existing_databases(database_name)?,
            can_use_file_system: self.can_use(StorageBackend::FileSystem),
            can_use_indexed_db: self.can_use(StorageBackend::IndexedDb),
            supports_shared_memory: self.shared_memory,
            shared_can_spawn_dedicated: kind == WorkerKind::Shared && self.nested_workers,
        })
    }
}

/// How in-process workers are wired to the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Envelopes moved through in-memory queues.
    #[default]
    Memory,
    /// Envelopes encoded as CBOR frames over a byte pipe.
    Framed,
}

/// The host environment: which worker kinds exist and what they can do.
#[derive(Debug, Clone, Deserialize)]
pub struct EnvironmentProfile {
    #[serde(default = "default_true")]
    pub dedicated_workers: bool,
    #[serde(default = "default_true")]
    pub shared_workers: bool,
    #[serde(default)]
    pub transport: TransportMode,
    #[serde(default)]
    pub environment: WorkerEnvironment,
}

impl Default for EnvironmentProfile {
    fn default() -> Self {
        Self {
            dedicated_workers: true,
            shared_workers: true,
            transport: TransportMode::default(),
            environment: WorkerEnvironment::default(),
        }
    }
}

impl EnvironmentProfile {
    pub fn supports(&self, kind: WorkerKind) -> bool {
        match kind {
            WorkerKind::Dedicated => self.dedicated_workers,
            WorkerKind::Shared => self.shared_workers,
        }
    }

    /// Load a profile from a TOML file, returning defaults if it does not
    /// exist.
    pub fn load(path: &Path) -> WdbResult<Self> {
        let expanded = expand_tilde(path);
        if !expanded.exists() {
            info!(path = %expanded.display(), "profile not found, using defaults");
            return Ok(Self::default());
        }

        info!(path = %expanded.display(), "loading worker profile");
        let content = std::fs::read_to_string(&expanded)?;
        let mut profile: Self = toml::from_str(&content)
            .map_err(|e| WdbError::Config(format!("profile parse error: {e}")))?;
        profile.environment.storage_root = profile
            .environment
            .storage_root
            .take()
            .map(|root| expand_tilde(&root));
        Ok(profile)
    }
}

fn default_true() -> bool {
    true
}

/// Expand `~` to the user's home directory.
pub(crate) fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
