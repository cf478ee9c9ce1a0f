//! Check-in error types

use rollcall_core::store::SessionId;
use rollcall_crypto::SessionError;
use rollcall_identity::IdentityError;
use thiserror::Error;

/// Errors that can occur while recording attendance.
#[derive(Debug, Error)]
pub enum CheckinError {
    /// No roster entry for the session, so no scheduled start to judge against
    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),

    /// Event falls on another day than the session, or before its early window
    #[error("Check-in at {time} is outside session {session_id}")]
    OutsideSession { session_id: SessionId, time: String },

    /// Presented certificate failed verification or is not the issued one
    #[error("Check-in not authenticated: {0}")]
    Unauthenticated(#[source] IdentityError),

    /// Sealed check-in did not authenticate under the session key
    #[error("Sealed check-in rejected: {0}")]
    Sealed(#[source] SessionError),

    /// Sealed message reused a nonce already accepted on the session
    #[error("Replayed sealed check-in")]
    Replayed,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Store errors propagate unchanged
    #[error("Store error: {0}")]
    Store(#[from] rollcall_core::Error),
}

/// Result type for check-in operations.
pub type Result<T> = std::result::Result<T, CheckinError>;
