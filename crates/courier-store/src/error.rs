use courier_shared::{CryptoError, IdentityError};
use thiserror::Error;

/// Errors produced by the persistence layer.
///
/// In-memory store operations never fail; mutating something that does not
/// exist is a no-op reported through the return value.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// A stored column could not be decoded.
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// Encrypted column failed to seal or open.
    #[error("Encryption error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Invalid identifier: {0}")]
    Identity(#[from] IdentityError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Chrono parsing error.
    #[error("Timestamp parse error: {0}")]
    ChronoParse(#[from] chrono::ParseError),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
