//! Error types for Rollcall identity operations.
//!
//! Issuance refusals carry a [`DenialReason`] for audit logs, but every
//! refusal renders the same way so a caller cannot probe which identities
//! exist or which tokens were already spent.

use rollcall_crypto::AgreementError;
use thiserror::Error;

/// Why an issuance request was refused. Audit-only; never shown to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DenialReason {
    UnknownIdentity,
    TokenMismatch,
    AlreadyIssued,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenialReason::UnknownIdentity => "unknown_identity",
            DenialReason::TokenMismatch => "token_mismatch",
            DenialReason::AlreadyIssued => "already_issued",
        }
    }
}

/// Errors that can occur in identity operations.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Issuance refused; see [`DenialReason`]
    #[error("issuance denied")]
    Denied(DenialReason),

    #[error("Certificate expired")]
    ExpiredCertificate,

    #[error("Certificate signature invalid")]
    SignatureInvalid,

    /// Request failed validation before reaching the CA
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Store errors propagate unchanged
    #[error("Store error: {0}")]
    Store(#[from] rollcall_core::Error),
}

impl IdentityError {
    pub fn denial_reason(&self) -> Option<DenialReason> {
        match self {
            IdentityError::Denied(reason) => Some(*reason),
            _ => None,
        }
    }
}

/// Errors raised while running the session handshake.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    /// Peer certificate failed CA signature or expiry checks
    #[error("Certificate rejected: {0}")]
    CertificateRejected(String),

    /// Transcript signature did not verify against the peer certificate
    #[error("Session signature invalid")]
    SignatureInvalid,

    /// No pending handshake for this identity (never started, or already used)
    #[error("Unknown session")]
    UnknownSession,

    #[error("Handshake expired")]
    Expired,

    /// An unexpired handshake for this identity is already pending
    #[error("Handshake already in progress")]
    InProgress,

    #[error("Invalid peer session key")]
    InvalidPeerKey,

    #[error("Session key derivation failed")]
    KeyDerivation,

    #[error("Handshake state unavailable: {0}")]
    Unavailable(String),
}

impl From<AgreementError> for HandshakeError {
    fn from(err: AgreementError) -> Self {
        match err {
            AgreementError::InvalidPeerKey => HandshakeError::InvalidPeerKey,
            AgreementError::KeyDerivation => HandshakeError::KeyDerivation,
        }
    }
}

/// Result type for identity operations.
pub type Result<T> = std::result::Result<T, IdentityError>;
