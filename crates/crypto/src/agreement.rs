//! ECDH session key agreement.
//!
//! Both sides run P-256 ECDH and feed the shared x-coordinate through
//! HKDF-SHA256 (no salt, info `"handshake data"`) to get a 32-byte session
//! key. The raw shared secret is never returned.

use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::keys::{AgreementKeyPair, PublicKeyBytes};

/// HKDF info string. Must match the device firmware.
pub const HKDF_INFO: &[u8] = b"handshake data";

/// Session key length in bytes (AES-256 / ChaCha20 key).
pub const SESSION_KEY_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AgreementError {
    #[error("Invalid peer public key")]
    InvalidPeerKey,

    #[error("Key derivation failed")]
    KeyDerivation,
}

/// Symmetric session key, zeroized on drop.
#[derive(Clone)]
pub struct SessionKey(Zeroizing<[u8; SESSION_KEY_LEN]>);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; SESSION_KEY_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.0
    }
}

impl PartialEq for SessionKey {
    fn eq(&self, other: &Self) -> bool {
        use subtle::ConstantTimeEq;
        self.0[..].ct_eq(&other.0[..]).into()
    }
}

impl Eq for SessionKey {}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(<redacted>)")
    }
}

/// Derive the session key shared with `peer_public`.
///
/// Fails with [`AgreementError::InvalidPeerKey`] if the peer bytes are not an
/// uncompressed point on P-256.
pub fn derive_shared_key(
    mine: &AgreementKeyPair,
    peer_public: &[u8],
) -> Result<SessionKey, AgreementError> {
    let peer = PublicKeyBytes::from_slice(peer_public)
        .and_then(|p| p.to_point())
        .map_err(|_| AgreementError::InvalidPeerKey)?;

    let shared = mine.secret().diffie_hellman(&peer);
    expand(shared.raw_secret_bytes().as_slice())
}

fn expand(ikm: &[u8]) -> Result<SessionKey, AgreementError> {
    let hk = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = Zeroizing::new([0u8; SESSION_KEY_LEN]);
    hk.expand(HKDF_INFO, &mut okm[..])
        .map_err(|_| AgreementError::KeyDerivation)?;
    Ok(SessionKey(okm))
}
