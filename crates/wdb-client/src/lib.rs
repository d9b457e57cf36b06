//! wdb-client: coordinator side of the wdb protocol.
//!
//! A [`SessionManager`] starts one dedicated and one shared worker context
//! through a [`WorkerSpawner`](wdb_core::WorkerSpawner), detects what they
//! support, and opens databases inside them as [`RemoteDatabase`] proxies.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use wdb_client::{ProcessSpawner, SessionConfig, SessionManager};
//!
//! # async fn example() -> wdb_client::WdbResult<()> {
//! let config = SessionConfig::default();
//! let manager = SessionManager::new(Arc::new(ProcessSpawner::from_config(&config)), config);
//!
//! let db = manager.open("notes").await?;
//! db.execute("CREATE TABLE IF NOT EXISTS note(body TEXT)", vec![]).await?;
//! db.execute("INSERT INTO note VALUES (?)", vec!["hello".into()]).await?;
//! let rows = db.select("SELECT body FROM note", vec![]).await?;
//! println!("{:?}", rows.rows);
//!
//! db.dispose().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod database;
pub mod manager;
pub mod process;

// Re-export primary public types.
pub use config::{ClientConfig, SessionConfig};
pub use connection::{UpdateStream, WorkerConnection};
pub use database::{RemoteDatabase, UpdateSubscription};
pub use manager::{FeatureReport, SessionManager};
pub use process::ProcessSpawner;

// Re-export wdb-core types used in this crate's API.
pub use wdb_core::messages::{UpdateKind, UpdateNotification};
pub use wdb_core::{AccessMode, MissingFeature, RowSet, SqlValue, StorageBackend, WdbError, WdbResult};
