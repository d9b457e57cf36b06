//! wdb-worker: one worker context served over stdin/stdout.
//!
//! Started by a coordinator; logs go to stderr since stdout carries frames.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing::info;
use wdb_core::messages::WorkerKind;
use wdb_worker::{serve_stdio, EnvironmentProfile};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KindArg {
    Dedicated,
    Shared,
}

impl From<KindArg> for WorkerKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Dedicated => WorkerKind::Dedicated,
            KindArg::Shared => WorkerKind::Shared,
        }
    }
}

/// Database worker process
#[derive(Parser, Debug)]
#[command(name = "wdb-worker", version, about = "wdb database worker")]
struct Cli {
    /// Worker kind to act as
    #[arg(long, value_enum, default_value = "dedicated")]
    kind: KindArg,

    /// Profile file describing the worker environment
    #[arg(long, default_value = "~/.wdb/worker.toml")]
    profile: String,

    /// Directory for persistent databases (overrides the profile)
    #[arg(long)]
    storage_root: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut profile = EnvironmentProfile::load(&PathBuf::from(&cli.profile))
        .context("failed to load worker profile")?;
    if let Some(root) = cli.storage_root {
        profile.environment.storage_root = Some(root);
    }

    let kind = WorkerKind::from(cli.kind);
    info!(version = env!("CARGO_PKG_VERSION"), ?kind, "starting wdb-worker");

    serve_stdio(kind, profile.environment)
        .await
        .context("worker failed")?;
    Ok(())
}
