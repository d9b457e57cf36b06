//! Coordinator configuration at `~/.wdb/config.toml`.
//!
//! Only the `[session]` table exists today; missing keys take defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use wdb_core::{WdbError, WdbResult};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub session: SessionConfig,
}

/// Settings for a [`SessionManager`](crate::SessionManager).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Location of the engine binary, passed to workers on open.
    #[serde(default = "default_wasm_uri")]
    pub wasm_uri: String,

    /// How long a new worker may take to announce itself.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Per-request timeout. 0 waits until the channel terminates.
    #[serde(default)]
    pub request_timeout_secs: u64,

    /// `wdb-worker` executable used by the process spawner.
    #[serde(default)]
    pub worker_path: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            wasm_uri: default_wasm_uri(),
            handshake_timeout_secs: default_handshake_timeout(),
            request_timeout_secs: 0,
            worker_path: None,
        }
    }
}

fn default_wasm_uri() -> String {
    "sqlite3.wasm".to_string()
}

fn default_handshake_timeout() -> u64 {
    10
}

impl SessionConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        match self.request_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// The worker executable: configured path, else `wdb-worker` on `PATH`.
    pub fn worker_program(&self) -> PathBuf {
        self.worker_path
            .as_deref()
            .map(expand_tilde)
            .unwrap_or_else(|| PathBuf::from("wdb-worker"))
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &Path) -> WdbResult<Self> {
        let path = expand_tilde(path);
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)?;
        let config: ClientConfig = toml::from_str(&content).map_err(|e| {
            WdbError::Config(format!("failed to parse config at {}: {e}", path.display()))
        })?;

        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Default location of the config file.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".wdb")
            .join("config.toml")
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
