//! Core functionality for the Rollcall attendance system.
//!
//! This crate provides the shared configuration, logging, error types and
//! the store contracts every other Rollcall crate persists through.

pub mod config;
pub mod error;
pub mod logging;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod store;
pub mod time;

pub use config::{
    AeadAlgorithm, CaConfig, CheckinConfig, Config, LoggingConfig, SessionConfig, StoreConfig,
};
pub use error::{Error, Result};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
pub use store::{
    CheckStatus, CheckinId, CheckinKey, CheckinRecord, CheckinStore, CheckinTransaction,
    EmployeeId, IdentityStore, MemoryStore, NewCheckinRecord, PendingIdentity, Session,
    SessionDirectory, SessionId, TimeSlot,
};
