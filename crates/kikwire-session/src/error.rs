//! Error types for the session layer.

use std::io;

/// Errors that can occur while loading or saving a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The store could not read or write its backing storage.
    #[error("session storage I/O failed for {path}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    /// A stored session could not be encoded or decoded.
    #[error("session record is not valid JSON")]
    Serialize(#[from] serde_json::Error),

    /// The account id can't be used as a storage key: it is empty or
    /// contains a path separator.
    #[error("invalid account id {0:?}")]
    InvalidAccount(String),
}
