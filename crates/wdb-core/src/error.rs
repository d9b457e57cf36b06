use thiserror::Error;

use crate::messages::{MissingFeature, MsgKind};

/// Errors produced by the wdb protocol layer.
#[derive(Debug, Error)]
pub enum WdbError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unexpected response: expected {expected:?}, got {actual:?}")]
    UnexpectedResponse { expected: MsgKind, actual: MsgKind },

    #[error("missing feature: {0:?}")]
    MissingFeature(MissingFeature),

    #[error("engine error: {0}")]
    Engine(String),

    #[error("database {0} has been disposed")]
    Disposed(u32),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("worker start failed: {0}")]
    StartFailed(String),

    #[error("timeout")]
    Timeout,

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl WdbError {
    /// Whether this error means the underlying worker channel is gone.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed | Self::Transport(_))
    }

    /// Whether this error is a protocol violation (as opposed to an engine
    /// failure reported by the worker).
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_) | Self::UnexpectedResponse { .. } | Self::Codec(_)
        )
    }
}

impl From<ciborium::de::Error<std::io::Error>> for WdbError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        WdbError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for WdbError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        WdbError::Codec(e.to_string())
    }
}

pub type WdbResult<T> = Result<T, WdbError>;
