use std::path::PathBuf;

use agent_chat_client::{ClientError, ConnectionError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error while {operation} at {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to encode content of message '{id}': {source}")]
    Encode {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("stored message '{id}' has unreadable content: {source}")]
    Decode {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("stored message '{id}' has unknown role '{role}'")]
    UnknownRole { id: String, role: String },
}

impl StoreError {
    #[must_use]
    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection to {url} failed: {source}")]
    Connect {
        url: String,
        #[source]
        source: ConnectionError,
    },

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("transcript store: {0}")]
    Store(#[from] StoreError),

    #[error("no transcript path configured (set store.path)")]
    NoStorePath,

    #[error("failed to encode request payload: {0}")]
    Payload(#[source] serde_json::Error),

    #[error("gave up after {attempts} reconnect attempts")]
    ReconnectExhausted { attempts: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_error_names_the_url() {
        let err = SessionError::Connect {
            url: "ws://127.0.0.1:1".into(),
            source: ConnectionError::Closed,
        };
        assert!(err.to_string().contains("ws://127.0.0.1:1"));
    }

    #[test]
    fn unknown_role_message_names_the_row() {
        let err = StoreError::UnknownRole {
            id: "m1".into(),
            role: "narrator".into(),
        };
        assert_eq!(err.to_string(), "stored message 'm1' has unknown role 'narrator'");
    }
}
