//! Device identity and trust bootstrap for Rollcall.
//!
//! This crate turns a provisioned, token-gated identity into a signed device
//! certificate, and lets two certificate holders authenticate each other
//! and agree on a session key.
//!
//! # Core Concepts
//!
//! - **Provisioning**: an operator creates a pending identity with a one-time token
//! - **Issuance**: the CA consumes the token exactly once and certifies the device key
//! - **Handshake**: mutual challenge-response over certified keys, ending in
//!   an ECDH session key
//!
//! # Security Model
//!
//! - Token comparison is constant time
//! - Every issuance refusal looks the same to the caller; the reason is only logged
//! - Certificates are checked against a CA key the verifier already trusts,
//!   never against the key a certificate carries

pub mod error;
pub mod handshake;
pub mod pki;
pub mod provisioning;

pub use error::{DenialReason, HandshakeError, IdentityError, Result};
pub use handshake::{
    transcript, Credentials, EstablishedSession, Finish, Hello, Initiator, Reply, Responder,
    HANDSHAKE_NONCE_LEN, TRANSCRIPT_LEN,
};
pub use pki::{
    check_certificate, resolve_employee, validate_identity_id, verify_certificate, Certificate, CertificateAuthority,
    CertificateWire, IssueRequest, IssueRequestWire, IssuedCertificate,
};
pub use provisioning::{generate_token, ProvisionedIdentity, Provisioner, TOKEN_LEN};
