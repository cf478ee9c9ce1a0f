//! Core error types

use thiserror::Error;

/// Store and configuration errors shared by every Rollcall crate.
///
/// Store failures propagate unchanged to the caller; nothing in the core
/// retries a store operation.
#[derive(Debug, Error)]
pub enum Error {
    /// SQLite backend error
    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A record violated a store constraint (duplicate key, bad column value)
    #[error("Constraint violation: {0}")]
    Constraint(String),

    /// The store could not be reached or its lock was poisoned
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Configuration could not be loaded or is invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
