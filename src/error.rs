//! Crate-wide error taxonomy.
//!
//! The variants mirror how failures propagate through the bridge: only
//! `Configuration` and a store that stays unavailable past the startup
//! retry window are fatal; everything else is handled per message.

use crate::message::DataType;

/// Errors surfaced by the buffer, store and adapters.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Malformed or unknown configuration; fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The store file cannot be opened or a transaction failed at the
    /// I/O level.
    #[error("store unavailable")]
    StoreUnavailable(#[source] sqlx::Error),

    /// Schema migration failure on startup.
    #[error("store migration failed")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// Schema or row-level corruption. The offending row is quarantined
    /// to the archive and processing continues.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// MQTT or OPC-UA I/O failure; always retryable.
    #[error("transport error: {0}")]
    Transport(String),

    /// A payload does not match its declared data type; permanent.
    #[error("cannot coerce {value:?} to {data_type}")]
    TypeCoercion {
        /// The offending raw payload.
        value: String,
        /// The declared type it failed to match.
        data_type: DataType,
    },

    /// Soft capacity cap reached; non-critical enqueues fail fast.
    #[error("buffer full")]
    BufferFull,

    /// Shutdown in progress.
    #[error("cancelled")]
    Cancelled,
}

impl From<sqlx::Error> for BridgeError {
    fn from(source: sqlx::Error) -> Self {
        Self::StoreUnavailable(source)
    }
}

impl From<sqlx::migrate::MigrateError> for BridgeError {
    fn from(source: sqlx::migrate::MigrateError) -> Self {
        Self::Migration(source)
    }
}

impl BridgeError {
    /// Whether retrying the same operation can ever succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::StoreUnavailable(_) | BridgeError::Transport(_) | BridgeError::BufferFull
        )
    }
}
