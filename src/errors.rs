//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Malformed frame or invalid inbound payload.
    Protocol(String),
    /// The peer on the other end answered a request with an error object.
    Remote {
        /// JSON-RPC error code reported by the remote side.
        code: i64,
        /// Human-readable message reported by the remote side.
        message: String,
    },
    /// The connection was stopped before the operation could complete.
    ConnectionClosed,
    /// An outbound request did not receive a response in time.
    Timeout(String),
    /// Agent runtime failure while running a query.
    Runtime(String),
    /// Session-level rule violation (busy session, kind mismatch, bad transition).
    Session(String),
    /// Local socket or named pipe failure.
    Ipc(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Remote { code, message } => write!(f, "remote error {code}: {message}"),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::Runtime(msg) => write!(f, "runtime: {msg}"),
            Self::Session(msg) => write!(f, "session: {msg}"),
            Self::Ipc(msg) => write!(f, "ipc: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(format!("invalid json: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
