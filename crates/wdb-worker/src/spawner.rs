//! In-process workers: each spawned worker is a tokio task serving one end
//! of a channel pair.

use futures_util::future::BoxFuture;
use tracing::{debug, warn};

use wdb_core::messages::WorkerKind;
use wdb_core::{duplex_pair, memory_pair, Channel, WdbResult, WorkerSpawner};

use crate::config::{EnvironmentProfile, TransportMode};
use crate::server::serve;

/// Spawns workers as tasks in the current runtime.
#[derive(Debug, Clone, Default)]
pub struct LocalSpawner {
    profile: EnvironmentProfile,
}

impl LocalSpawner {
    pub fn new(profile: EnvironmentProfile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> &EnvironmentProfile {
        &self.profile
    }
}

impl WorkerSpawner for LocalSpawner {
    fn spawn(&self, kind: WorkerKind) -> BoxFuture<'_, WdbResult<Option<Channel>>> {
        Box::pin(async move {
            if !self.profile.supports(kind) {
                debug!(?kind, "worker kind not available");
                return Ok(None);
            }

            let (coordinator_end, worker_end) = match self.profile.transport {
                TransportMode::Memory => memory_pair(),
                TransportMode::Framed => duplex_pair(),
            };
            let environment = self.profile.environment.clone();
            tokio::spawn(async move {
                if let Err(e) = serve(kind, environment, worker_end).await {
                    warn!(?kind, error = %e, "worker exited with error");
                }
            });

            debug!(?kind, transport = ?self.profile.transport, "spawned in-process worker");
            Ok(Some(coordinator_end))
        })
    }
}
