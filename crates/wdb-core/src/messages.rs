//! wdb protocol envelopes.
//!
//! Every message crossing a worker channel is an [`Envelope`]: a request
//! (carrying a correlation id), the response to one, or an unsolicited
//! notification.

use serde::{Deserialize, Serialize};

/// Protocol version exchanged in the ready handshake.
pub const PROTOCOL_VERSION: &str = "wdb-1";

/// Numeric message kind tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum MsgKind {
    OpenDatabase = 0x01,
    CloseDatabase = 0x02,
    RunQuery = 0x03,
    DedicatedCompatibilityCheck = 0x04,
    SharedCompatibilityCheck = 0x05,
    ToggleUpdateStream = 0x06,

    SimpleSuccessResponse = 0x10,
    RowsResponse = 0x11,

    UpdateNotification = 0x20,
    Ready = 0x21,
}

impl From<MsgKind> for u8 {
    fn from(m: MsgKind) -> u8 {
        m as u8
    }
}

impl TryFrom<u8> for MsgKind {
    type Error = String;
    fn try_from(v: u8) -> Result<Self, String> {
        match v {
            0x01 => Ok(Self::OpenDatabase),
            0x02 => Ok(Self::CloseDatabase),
            0x03 => Ok(Self::RunQuery),
            0x04 => Ok(Self::DedicatedCompatibilityCheck),
            0x05 => Ok(Self::SharedCompatibilityCheck),
            0x06 => Ok(Self::ToggleUpdateStream),
            0x10 => Ok(Self::SimpleSuccessResponse),
            0x11 => Ok(Self::RowsResponse),
            0x20 => Ok(Self::UpdateNotification),
            0x21 => Ok(Self::Ready),
            _ => Err(format!("unknown message kind: 0x{v:02x}")),
        }
    }
}

/// The two isolation models a worker context can use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    Dedicated,
    Shared,
}

impl WorkerKind {
    /// The feature reported missing when this kind cannot be spawned.
    pub fn missing_feature(self) -> MissingFeature {
        match self {
            Self::Dedicated => MissingFeature::DedicatedWorkers,
            Self::Shared => MissingFeature::SharedWorkers,
        }
    }
}

/// Persistent (or not) storage a worker-hosted database lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    InMemory,
    /// Synchronous file system access. Requires shared memory.
    FileSystem,
    /// Key/value block storage.
    IndexedDb,
}

/// Which worker connection hosts a database opened by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    #[default]
    DedicatedWorker,
    SharedWorker,
}

impl AccessMode {
    pub fn worker_kind(self) -> WorkerKind {
        match self {
            Self::DedicatedWorker => WorkerKind::Dedicated,
            Self::SharedWorker => WorkerKind::Shared,
        }
    }
}

/// Capabilities the coordinator can find missing after feature detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingFeature {
    DedicatedWorkers,
    SharedWorkers,
    FileSystemAccess,
    IndexedDb,
    SharedMemory,
    DedicatedWorkersInSharedWorkers,
}

// ── Values ──────────────────────────────────────────────────────────

/// A single SQL value marshalled across the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(#[serde(with = "serde_bytes")] Vec<u8>),
}

impl SqlValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        Self::Real(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Blob(v)
    }
}

/// Rows returned by a query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

impl RowSet {
    /// First column of the first row, if any.
    pub fn first_value(&self) -> Option<&SqlValue> {
        self.rows.first().and_then(|row| row.first())
    }
}

// ── Envelope ────────────────────────────────────────────────────────

/// Every message on a worker channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub request_id: u32,
    pub payload: RequestPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RequestPayload {
    OpenDatabase(OpenDatabasePayload),
    CloseDatabase(CloseDatabasePayload),
    RunQuery(RunQueryPayload),
    DedicatedCompatibilityCheck(CompatibilityCheckPayload),
    SharedCompatibilityCheck(CompatibilityCheckPayload),
    ToggleUpdateStream(ToggleUpdateStreamPayload),
}

impl RequestPayload {
    pub fn kind(&self) -> MsgKind {
        match self {
            Self::OpenDatabase(_) => MsgKind::OpenDatabase,
            Self::CloseDatabase(_) => MsgKind::CloseDatabase,
            Self::RunQuery(_) => MsgKind::RunQuery,
            Self::DedicatedCompatibilityCheck(_) => MsgKind::DedicatedCompatibilityCheck,
            Self::SharedCompatibilityCheck(_) => MsgKind::SharedCompatibilityCheck,
            Self::ToggleUpdateStream(_) => MsgKind::ToggleUpdateStream,
        }
    }

    /// The response kind a successful reply to this request must carry.
    pub fn expected_response(&self) -> MsgKind {
        match self {
            Self::RunQuery(q) if q.return_rows => MsgKind::RowsResponse,
            Self::DedicatedCompatibilityCheck(_) => MsgKind::DedicatedCompatibilityCheck,
            Self::SharedCompatibilityCheck(_) => MsgKind::SharedCompatibilityCheck,
            _ => MsgKind::SimpleSuccessResponse,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenDatabasePayload {
    pub wasm_uri: String,
    pub database_name: String,
    pub storage: StorageBackend,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseDatabasePayload {
    pub database_id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunQueryPayload {
    pub database_id: u32,
    pub sql: String,
    #[serde(default)]
    pub parameters: Vec<SqlValue>,
    pub return_rows: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompatibilityCheckPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToggleUpdateStreamPayload {
    pub database_id: u32,
    pub enable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub request_id: u32,
    pub body: ResponseBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseBody {
    Success(ResponsePayload),
    Error(ErrorPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponsePayload {
    SimpleSuccess(Option<SqlValue>),
    Rows(RowSet),
    DedicatedCompatibility(CompatibilityResult),
    SharedCompatibility(CompatibilityResult),
}

impl ResponsePayload {
    pub fn kind(&self) -> MsgKind {
        match self {
            Self::SimpleSuccess(_) => MsgKind::SimpleSuccessResponse,
            Self::Rows(_) => MsgKind::RowsResponse,
            Self::DedicatedCompatibility(_) => MsgKind::DedicatedCompatibilityCheck,
            Self::SharedCompatibility(_) => MsgKind::SharedCompatibilityCheck,
        }
    }
}

/// Failure reported by the responder, surfaced verbatim to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// What one worker reports about its environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompatibilityResult {
    #[serde(default)]
    pub existing_databases: Vec<String>,
    pub can_use_file_system: bool,
    pub can_use_indexed_db: bool,
    pub supports_shared_memory: bool,
    /// Only meaningful when reported by a shared worker.
    #[serde(default)]
    pub shared_can_spawn_dedicated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub payload: NotificationPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NotificationPayload {
    Update(UpdateNotification),
    Ready(ReadyNotification),
}

impl NotificationPayload {
    pub fn kind(&self) -> MsgKind {
        match self {
            Self::Update(_) => MsgKind::UpdateNotification,
            Self::Ready(_) => MsgKind::Ready,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    Insert,
    Update,
    Delete,
}

/// A row change inside one worker-hosted database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateNotification {
    pub database_id: u32,
    pub table: String,
    pub rowid: i64,
    pub kind: UpdateKind,
}

/// First message a worker sends once it can serve requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyNotification {
    pub protocol_version: String,
    pub kind: WorkerKind,
}

impl ReadyNotification {
    pub fn new(kind: WorkerKind) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            kind,
        }
    }
}

// ── Helper modules ──────────────────────────────────────────────────

mod serde_bytes {
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let buf: ByteBuf = Deserialize::deserialize(deserializer)?;
        Ok(buf.0)
    }

    struct ByteBuf(Vec<u8>);

    impl<'de> Deserialize<'de> for ByteBuf {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            struct ByteBufVisitor;

            impl<'de> serde::de::Visitor<'de> for ByteBufVisitor {
                type Value = ByteBuf;

                fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                    formatter.write_str("bytes")
                }

                fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E> {
                    Ok(ByteBuf(v.to_vec()))
                }

                fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<Self::Value, E> {
                    Ok(ByteBuf(v))
                }

                fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
                where
                    A: serde::de::SeqAccess<'de>,
                {
                    let mut bytes = Vec::new();
                    while let Some(b) = seq.next_element::<u8>()? {
                        bytes.push(b);
                    }
                    Ok(ByteBuf(bytes))
                }
            }

            deserializer.deserialize_any(ByteBufVisitor)
        }
    }
}
