//! wdb-core: Shared protocol library for worker-hosted databases.
//!
//! Provides the envelope model, CBOR framing, raw envelope channels and the
//! request/response correlation layer used by both the coordinator
//! (`wdb-client`) and the worker (`wdb-worker`).

pub mod codec;
pub mod error;
pub mod messages;
pub mod protocol;
pub mod transport;

// Re-export commonly used items at crate root.
pub use codec::{cbor_decode, frame_encode, FrameDecoder};
pub use error::{WdbError, WdbResult};
pub use messages::{
    AccessMode, MissingFeature, MsgKind, RowSet, SqlValue, StorageBackend, WorkerKind,
    PROTOCOL_VERSION,
};
pub use protocol::{ProtocolChannel, Responder};
pub use transport::{duplex_pair, framed, memory_pair, Channel, WorkerSpawner};
