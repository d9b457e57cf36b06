//! Workers as child processes speaking framed CBOR over stdio.

use std::path::PathBuf;
use std::process::Stdio;

use futures_util::future::BoxFuture;
use tokio::process::Command;
use tracing::{debug, info, warn};

use wdb_core::messages::WorkerKind;
use wdb_core::{framed, Channel, WdbError, WdbResult, WorkerSpawner};

use crate::config::SessionConfig;

/// Launches one `wdb-worker` process per spawned worker.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
    kinds: Vec<WorkerKind>,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            kinds: vec![WorkerKind::Dedicated, WorkerKind::Shared],
        }
    }

    /// Spawner for the worker executable named in `config`.
    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.worker_program())
    }

    /// Extra arguments passed to every worker, after `--kind`.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Restrict which worker kinds this environment provides.
    pub fn with_kinds(mut self, kinds: &[WorkerKind]) -> Self {
        self.kinds = kinds.to_vec();
        self
    }

    fn kind_arg(kind: WorkerKind) -> &'static str {
        match kind {
            WorkerKind::Dedicated => "dedicated",
            WorkerKind::Shared => "shared",
        }
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self, kind: WorkerKind) -> BoxFuture<'_, WdbResult<Option<Channel>>> {
        Box::pin(async move {
            if !self.kinds.contains(&kind) {
                debug!(?kind, "worker kind not provided");
                return Ok(None);
            }

            let mut child = Command::new(&self.program)
                .arg("--kind")
                .arg(Self::kind_arg(kind))
                .args(&self.args)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| {
                    WdbError::Transport(format!(
                        "failed to start {}: {e}",
                        self.program.display()
                    ))
                })?;

            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| WdbError::Transport("worker stdin not captured".into()))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| WdbError::Transport("worker stdout not captured".into()))?;

            info!(?kind, pid = ?child.id(), program = %self.program.display(), "worker process started");

            // The channel closes when the child exits; the child is killed
            // if the runtime drops this task first.
            tokio::spawn(async move {
                match child.wait().await {
                    Ok(status) if status.success() => debug!(?kind, "worker process exited"),
                    Ok(status) => warn!(?kind, %status, "worker process failed"),
                    Err(e) => warn!(?kind, error = %e, "failed to wait for worker process"),
                }
            });

            Ok(Some(framed(stdout, stdin)))
        })
    }
}
