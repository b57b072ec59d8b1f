//! Failure taxonomy for result streams and connection establishment.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::value::Value;

/// The kind of failure a result stream is in.
///
/// Each kind carries a stable numeric identifier, available via
/// [`FailureKind::code`], so callers can switch on failures without matching
/// on error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The server reported that statement evaluation failed. The stream
    /// carries the server's error code and message.
    StatementEvaluationFailed,
    /// The server violated the protocol; the connection is poisoned.
    ProtocolError,
    /// The connection closed before the stream completed.
    ConnectionClosed,
    /// A message exceeded the receive size bound.
    OutOfMemory,
    /// An I/O error surfaced from the transport.
    Transport,
}

impl FailureKind {
    /// The stable numeric identifier of this failure kind.
    pub const fn code(self) -> u32 {
        match self {
            FailureKind::StatementEvaluationFailed => 1,
            FailureKind::ProtocolError => 2,
            FailureKind::ConnectionClosed => 3,
            FailureKind::OutOfMemory => 4,
            FailureKind::Transport => 5,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::StatementEvaluationFailed => "statement evaluation failed",
            FailureKind::ProtocolError => "protocol error",
            FailureKind::ConnectionClosed => "connection closed",
            FailureKind::OutOfMemory => "out of memory",
            FailureKind::Transport => "transport error",
        };
        write!(f, "{name}")
    }
}

/// A structured failure sent by the server.
///
/// Carries the server's short error code (e.g.
/// `Neo.ClientError.Statement.SyntaxError`) and its human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerFailure {
    code: String,
    message: String,
}

impl ServerFailure {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Extracts code and message from a `FAILURE` metadata map.
    ///
    /// Missing or non-string entries come back as empty strings; the server
    /// is expected to populate both but the client must not fall over when
    /// it does not.
    pub fn from_metadata(metadata: Option<&HashMap<String, Value>>) -> Self {
        let field = |key: &str| {
            metadata
                .and_then(|m| m.get(key))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Self {
            code: field("code"),
            message: field("message"),
        }
    }

    /// The server-supplied short error code.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// The server-supplied human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for ServerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// The error type for result stream operations.
///
/// Cloneable so a failed stream can keep returning its failure on every
/// subsequent call.
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    #[error("statement evaluation failed: {0}")]
    Server(ServerFailure),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("connection closed before the stream completed")]
    ConnectionClosed,
    #[error("message exceeded the receive size bound")]
    OutOfMemory,
    #[error("transport error: {0}")]
    Io(Arc<std::io::Error>),
    #[error("field index {index} out of range for {nfields} fields")]
    FieldOutOfRange { index: usize, nfields: usize },
    #[error("result stream is closed")]
    Closed,
}

impl StreamError {
    /// The failure kind this error corresponds to, if it poisons a stream.
    ///
    /// Local errors ([`StreamError::FieldOutOfRange`], [`StreamError::Closed`])
    /// have no kind: they are surfaced from the failing call without marking
    /// the stream as failed.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            StreamError::Server(_) => Some(FailureKind::StatementEvaluationFailed),
            StreamError::Protocol(_) => Some(FailureKind::ProtocolError),
            StreamError::ConnectionClosed => Some(FailureKind::ConnectionClosed),
            StreamError::OutOfMemory => Some(FailureKind::OutOfMemory),
            StreamError::Io(_) => Some(FailureKind::Transport),
            StreamError::FieldOutOfRange { .. } | StreamError::Closed => None,
        }
    }
}

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::InvalidData => StreamError::Protocol(err.to_string()),
            std::io::ErrorKind::QuotaExceeded => StreamError::OutOfMemory,
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => StreamError::ConnectionClosed,
            _ => StreamError::Io(Arc::new(err)),
        }
    }
}

/// The error type for connection establishment.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("I/O error during connect: {0}")]
    Io(#[from] std::io::Error),
    #[error("server accepted none of the proposed protocol versions")]
    VersionRejected,
    #[error("server selected unsupported protocol version {0}")]
    UnsupportedVersion(u32),
    #[error("initialization failed: {0}")]
    Init(ServerFailure),
    #[error("unexpected response during connect: {0}")]
    Unexpected(String),
}

impl From<String> for ConnectError {
    fn from(value: String) -> Self {
        ConnectError::Unexpected(value)
    }
}
