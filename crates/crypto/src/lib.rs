//! Cryptographic primitives for the Rollcall trust bootstrap.
//!
//! This crate provides key management, signing and verification, session
//! key agreement and authenticated session encryption. Everything runs on
//! NIST P-256 so the server interoperates with device firmware.
//!
//! # Core Capabilities
//!
//! - **Digital Signatures**: ECDSA P-256 / SHA-256, DER encoded
//! - **Key Agreement**: ECDH followed by HKDF-SHA256
//! - **Session Encryption**: AES-256-GCM or ChaCha20-Poly1305 with detached tags
//! - **Key Management**: PEM loading, validated public points, BLAKE3 key ids
//!
//! # Security Principles
//!
//! - Never roll custom cryptographic primitives
//! - All signatures must be verified before trust
//! - Secrets must never be logged; log [`signing::key_id`] fingerprints
//! - Session keys are ephemeral and zeroized on drop

pub mod agreement;
pub mod hex_serde;
pub mod keys;
pub mod session;
pub mod signing;

pub use agreement::{derive_shared_key, AgreementError, SessionKey, HKDF_INFO, SESSION_KEY_LEN};
pub use keys::{AgreementKeyPair, KeyError, PublicKeyBytes, SigningKeyPair, PUBLIC_KEY_LEN};
pub use session::{
    decrypt, decrypt_with, encrypt, encrypt_with, AeadAlgorithm, AeadMessage, SessionCipher,
    SessionError, SessionResult, NONCE_SIZE, TAG_SIZE,
};
pub use signing::{key_id, sign, verify, verify_with};
