//! wdb-worker: hosts SQLite databases inside worker contexts and serves the
//! wdb protocol to a coordinator.
//!
//! Workers run either as tasks in the coordinator's process ([`LocalSpawner`])
//! or as a separate `wdb-worker` process speaking framed CBOR over stdio.

pub mod config;
pub mod host;
pub mod server;
pub mod spawner;
mod values;

pub use config::{EnvironmentProfile, TransportMode, WorkerEnvironment};
pub use host::WorkerHost;
pub use server::{serve, serve_stdio};
pub use spawner::LocalSpawner;
