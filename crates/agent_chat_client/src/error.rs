//! Error types for the transport, streams and configuration.

use thiserror::Error;

/// Failure reported by a `Connection` collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("connection is closed")]
    Closed,

    #[error("connection failed: {0}")]
    Failed(String),
}

/// Malformed or unencodable frame. Inbound protocol errors are dropped by the
/// dispatcher and never surfaced to stream consumers.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed inbound frame: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("failed to encode outbound frame: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Terminal failure of a single stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// The server reported `error: true`; the chunk body is the message.
    #[error("server error: {0}")]
    Remote(String),

    /// Local failure, e.g. the transport went away.
    #[error("stream failed: {0}")]
    Local(String),

    /// Deliberate stop by the caller or the user.
    #[error("stream cancelled")]
    Cancelled,
}

impl StreamError {
    /// Cancellation is a deliberate stop, not a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StreamError::Cancelled)
    }
}

/// Top-level library error.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The initial send of a request failed; there is no fallback.
    #[error("failed to send request {id}: {source}")]
    Send {
        id: String,
        #[source]
        source: ConnectionError,
    },

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Config load/save error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML in {path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("unable to determine config path (set --config or AGENT_CHAT_CONFIG)")]
    NoPath,
}
