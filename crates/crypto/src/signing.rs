//! ECDSA P-256 signing and verification.
//!
//! Signatures are ECDSA over SHA-256 of the message with RFC 6979
//! deterministic nonces, DER-encoded so device firmware (mbedTLS) can check
//! them. Verification also accepts the 64-byte fixed `r || s` form.
//!
//! # Security Model
//!
//! - `verify` never panics and never errors: malformed keys, malformed
//!   signatures and mismatches all come back as `false`
//! - Raw keys are never logged; [`key_id`] gives a stable fingerprint instead

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{DerSignature, Signature, VerifyingKey};

use crate::keys::{PublicKeyBytes, SigningKeyPair};

/// Sign `message` and return the DER-encoded signature.
pub fn sign(key: &SigningKeyPair, message: &[u8]) -> Vec<u8> {
    let signature: DerSignature = key.signing_key().sign(message);
    signature.as_bytes().to_vec()
}

/// Check `signature` over `message` against a SEC1 public key.
pub fn verify(message: &[u8], public_key: &[u8], signature: &[u8]) -> bool {
    let Ok(public) = PublicKeyBytes::from_slice(public_key) else {
        return false;
    };
    verify_with(message, &public, signature)
}

/// [`verify`] for an already validated public key.
pub fn verify_with(message: &[u8], public_key: &PublicKeyBytes, signature: &[u8]) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_sec1_bytes(public_key.as_bytes()) else {
        return false;
    };

    let parsed = Signature::from_der(signature).or_else(|_| Signature::from_slice(signature));
    match parsed {
        Ok(sig) => verifying_key.verify(message, &sig).is_ok(),
        Err(_) => false,
    }
}

/// Generates a stable public key identifier (first 16 bytes of BLAKE3,
/// lowercase hex). Used in logs in place of key material.
pub fn key_id(public_key: &PublicKeyBytes) -> String {
    let hash = blake3::hash(public_key.as_bytes());
    hex::encode(&hash.as_bytes()[..16])
}
