//! Authenticated encryption of session traffic.
//!
//! Messages are sealed with AES-256-GCM (default, what device firmware
//! speaks) or ChaCha20-Poly1305. Both take a 12-byte nonce and produce a
//! detached 16-byte tag, so an [`AeadMessage`] looks the same on the wire
//! whichever algorithm is configured:
//!
//! ```json
//! { "nonce": "…24 hex…", "ciphertext": "…", "tag": "…32 hex…" }
//! ```
//!
//! # Security Model
//!
//! - Every encryption draws a fresh nonce from the OS CSPRNG; there is no
//!   shared RNG state between callers
//! - Decryption is all-or-nothing: a bad tag yields no plaintext
//! - [`SessionCipher`] caps how many messages one key may seal. Random
//!   96-bit nonces start to risk collision around 2^32 messages, so the
//!   cipher refuses to go further and asks for a new key

use aes_gcm::aead::consts::{U12, U16};
use aes_gcm::aead::{AeadCore, AeadInPlace, KeyInit};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub use rollcall_core::config::AeadAlgorithm;

use crate::agreement::SessionKey;

/// Nonce size shared by both AEADs (96 bits / 12 bytes).
pub const NONCE_SIZE: usize = 12;

/// Tag size shared by both AEADs (128 bits / 16 bytes).
pub const TAG_SIZE: usize = 16;

/// Messages one key may seal before rotation is forced.
pub const DEFAULT_MESSAGE_BUDGET: u64 = 1 << 32;

/// Session cipher error types.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    /// Tag mismatch, wrong key, or malformed message parts
    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Key rotation required")]
    RotationRequired,

    #[error("Entropy source unavailable: {0}")]
    EntropyUnavailable(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),
}

/// Result type for session cipher operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// One sealed message: nonce, ciphertext and tag as discrete fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AeadMessage {
    #[serde(with = "crate::hex_serde::array")]
    pub nonce: [u8; NONCE_SIZE],
    #[serde(with = "crate::hex_serde::bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "crate::hex_serde::array")]
    pub tag: [u8; TAG_SIZE],
}

impl AeadMessage {
    /// Assemble a message from untrusted wire parts. Wrong nonce or tag
    /// lengths are an authentication failure, same as a bad tag.
    pub fn from_parts(nonce: &[u8], ciphertext: Vec<u8>, tag: &[u8]) -> SessionResult<Self> {
        let nonce = nonce
            .try_into()
            .map_err(|_| SessionError::AuthenticationFailed)?;
        let tag = tag
            .try_into()
            .map_err(|_| SessionError::AuthenticationFailed)?;
        Ok(Self {
            nonce,
            ciphertext,
            tag,
        })
    }
}

/// Encrypt with the default algorithm (AES-256-GCM).
pub fn encrypt(key: &SessionKey, plaintext: &[u8]) -> SessionResult<AeadMessage> {
    encrypt_with(AeadAlgorithm::default(), key, plaintext)
}

/// Decrypt with the default algorithm (AES-256-GCM).
pub fn decrypt(key: &SessionKey, message: &AeadMessage) -> SessionResult<Vec<u8>> {
    decrypt_with(AeadAlgorithm::default(), key, message)
}

pub fn encrypt_with(
    algorithm: AeadAlgorithm,
    key: &SessionKey,
    plaintext: &[u8],
) -> SessionResult<AeadMessage> {
    let mut nonce = [0u8; NONCE_SIZE];
    getrandom::getrandom(&mut nonce).map_err(|e| SessionError::EntropyUnavailable(e.to_string()))?;
    seal_with_nonce(algorithm, key, nonce, plaintext)
}

pub fn decrypt_with(
    algorithm: AeadAlgorithm,
    key: &SessionKey,
    message: &AeadMessage,
) -> SessionResult<Vec<u8>> {
    match algorithm {
        AeadAlgorithm::Aes256Gcm => open::<Aes256Gcm>(key, message),
        AeadAlgorithm::ChaCha20Poly1305 => open::<ChaCha20Poly1305>(key, message),
    }
}

pub(crate) fn seal_with_nonce(
    algorithm: AeadAlgorithm,
    key: &SessionKey,
    nonce: [u8; NONCE_SIZE],
    plaintext: &[u8],
) -> SessionResult<AeadMessage> {
    match algorithm {
        AeadAlgorithm::Aes256Gcm => seal::<Aes256Gcm>(key, nonce, plaintext),
        AeadAlgorithm::ChaCha20Poly1305 => seal::<ChaCha20Poly1305>(key, nonce, plaintext),
    }
}

fn seal<C>(key: &SessionKey, nonce: [u8; NONCE_SIZE], plaintext: &[u8]) -> SessionResult<AeadMessage>
where
    C: AeadInPlace + AeadCore<NonceSize = U12, TagSize = U16> + KeyInit,
{
    let cipher = C::new_from_slice(key.as_bytes())
        .map_err(|e| SessionError::Encryption(e.to_string()))?;

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(&nonce.into(), b"", &mut buffer)
        .map_err(|e| SessionError::Encryption(e.to_string()))?;

    Ok(AeadMessage {
        nonce,
        ciphertext: buffer,
        tag: tag.into(),
    })
}

fn open<C>(key: &SessionKey, message: &AeadMessage) -> SessionResult<Vec<u8>>
where
    C: AeadInPlace + AeadCore<NonceSize = U12, TagSize = U16> + KeyInit,
{
    let cipher =
        C::new_from_slice(key.as_bytes()).map_err(|_| SessionError::AuthenticationFailed)?;

    let mut buffer = message.ciphertext.clone();
    cipher
        .decrypt_in_place_detached(&message.nonce.into(), b"", &mut buffer, &message.tag.into())
        .map_err(|_| SessionError::AuthenticationFailed)?;
    Ok(buffer)
}

/// Session cipher holding one key and its remaining message budget.
pub struct SessionCipher {
    algorithm: AeadAlgorithm,
    key: SessionKey,

    /// Rotation counter, bumped on every [`SessionCipher::rotate`]
    epoch: u64,

    /// Messages sealed under the current key
    sealed: u64,

    max_messages: u64,
}

impl SessionCipher {
    pub fn new(key: SessionKey, algorithm: AeadAlgorithm) -> Self {
        Self::with_budget(key, algorithm, DEFAULT_MESSAGE_BUDGET)
    }

    pub fn with_budget(key: SessionKey, algorithm: AeadAlgorithm, max_messages: u64) -> Self {
        Self {
            algorithm,
            key,
            epoch: 0,
            sealed: 0,
            max_messages,
        }
    }

    /// Check if key rotation is required.
    pub fn rotation_required(&self) -> bool {
        self.sealed >= self.max_messages
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> SessionResult<AeadMessage> {
        if self.rotation_required() {
            warn!(epoch = self.epoch, "Session message budget exhausted");
            return Err(SessionError::RotationRequired);
        }

        let message = encrypt_with(self.algorithm, &self.key, plaintext)?;
        self.sealed += 1;
        Ok(message)
    }

    /// Decryption does not consume budget: nonces are only drawn when sealing.
    pub fn decrypt(&self, message: &AeadMessage) -> SessionResult<Vec<u8>> {
        decrypt_with(self.algorithm, &self.key, message)
    }

    /// Replace the key with a freshly agreed one. The old key is zeroized
    /// when dropped here.
    pub fn rotate(&mut self, key: SessionKey) {
        self.key = key;
        self.epoch += 1;
        self.sealed = 0;
    }

    pub fn algorithm(&self) -> AeadAlgorithm {
        self.algorithm
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn message_count(&self) -> u64 {
        self.sealed
    }
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCipher")
            .field("algorithm", &self.algorithm)
            .field("epoch", &self.epoch)
            .field("sealed", &self.sealed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn key(byte: u8) -> SessionKey {
        SessionKey::from_bytes([byte; 32])
    }

    #[test]
    fn test_encrypt_then_decrypt() {
        let k = key(1);
        let message = encrypt(&k, b"EMP01 08:02").unwrap();

        assert_eq!(message.ciphertext.len(), 11);
        assert_eq!(decrypt(&k, &message).unwrap(), b"EMP01 08:02");
    }

    #[test]
    fn test_empty_plaintext() {
        let k = key(2);
        let message = encrypt(&k, b"").unwrap();
        assert!(message.ciphertext.is_empty());
        assert_eq!(decrypt(&k, &message).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_chacha_round_trip_and_algorithms_do_not_mix() {
        let k = key(3);
        let message = encrypt_with(AeadAlgorithm::ChaCha20Poly1305, &k, b"payload").unwrap();
        assert_eq!(
            decrypt_with(AeadAlgorithm::ChaCha20Poly1305, &k, &message).unwrap(),
            b"payload"
        );
        assert_eq!(
            decrypt_with(AeadAlgorithm::Aes256Gcm, &k, &message),
            Err(SessionError::AuthenticationFailed)
        );
    }

    #[test]
    fn test_any_bit_flip_fails_authentication() {
        let k = key(4);
        let message = encrypt(&k, b"tamper evident").unwrap();

        for i in 0..message.ciphertext.len() {
            let mut tampered = message.clone();
            tampered.ciphertext[i] ^= 0x01;
            assert_eq!(decrypt(&k, &tampered), Err(SessionError::AuthenticationFailed));
        }
        for i in 0..TAG_SIZE {
            let mut tampered = message.clone();
            tampered.tag[i] ^= 0x80;
            assert_eq!(decrypt(&k, &tampered), Err(SessionError::AuthenticationFailed));
        }
        for i in 0..NONCE_SIZE {
            let mut tampered = message.clone();
            tampered.nonce[i] ^= 0x01;
            assert_eq!(decrypt(&k, &tampered), Err(SessionError::AuthenticationFailed));
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let message = encrypt(&key(5), b"secret").unwrap();
        assert_eq!(
            decrypt(&key(6), &message),
            Err(SessionError::AuthenticationFailed)
        );
    }

    #[test]
    fn test_truncated_ciphertext_fails() {
        let k = key(7);
        let mut message = encrypt(&k, b"sixteen byte msg").unwrap();
        message.ciphertext.pop();
        assert_eq!(decrypt(&k, &message), Err(SessionError::AuthenticationFailed));
    }

    #[test]
    fn test_from_parts_rejects_bad_lengths() {
        assert_eq!(
            AeadMessage::from_parts(&[0u8; 11], vec![], &[0u8; 16]),
            Err(SessionError::AuthenticationFailed)
        );
        assert_eq!(
            AeadMessage::from_parts(&[0u8; 12], vec![], &[0u8; 15]),
            Err(SessionError::AuthenticationFailed)
        );
        assert!(AeadMessage::from_parts(&[0u8; 12], vec![1, 2], &[0u8; 16]).is_ok());
    }

    #[test]
    fn test_nonces_are_unique() {
        let k = key(8);
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let message = encrypt(&k, b"x").unwrap();
            assert!(seen.insert(message.nonce));
        }
    }

    #[test]
    fn test_aes_gcm_known_answer() {
        // GCM specification test case 14: zero key, zero IV, one zero block
        let k = SessionKey::from_bytes([0u8; 32]);
        let message =
            seal_with_nonce(AeadAlgorithm::Aes256Gcm, &k, [0u8; NONCE_SIZE], &[0u8; 16]).unwrap();
        assert_eq!(
            hex::encode(&message.ciphertext),
            "cea7403d4d606b6e074ec5d3baf39d18"
        );
        assert_eq!(hex::encode(message.tag), "d0d1c8a799996bf0265b98b5d48ab919");

        // test case 13: empty plaintext
        let empty = seal_with_nonce(AeadAlgorithm::Aes256Gcm, &k, [0u8; NONCE_SIZE], &[]).unwrap();
        assert_eq!(hex::encode(empty.tag), "530f8afbc74536b9a963b4f1c4cb738b");
    }

    #[test]
    fn test_wire_json_uses_hex_fields() {
        let k = key(9);
        let message = encrypt(&k, b"hi").unwrap();
        let json = serde_json::to_value(&message).unwrap();

        assert_eq!(json["nonce"].as_str().unwrap().len(), 24);
        assert_eq!(json["tag"].as_str().unwrap().len(), 32);
        assert_eq!(json["ciphertext"].as_str().unwrap().len(), 4);

        let back: AeadMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, message);

        let short_nonce = serde_json::json!({
            "nonce": "00",
            "ciphertext": "",
            "tag": hex::encode([0u8; 16]),
        });
        assert!(serde_json::from_value::<AeadMessage>(short_nonce).is_err());
    }

    #[test]
    fn test_budget_forces_rotation() {
        let mut cipher = SessionCipher::with_budget(key(10), AeadAlgorithm::Aes256Gcm, 3);

        for _ in 0..3 {
            cipher.encrypt(b"m").unwrap();
        }
        assert!(cipher.rotation_required());
        assert_eq!(cipher.encrypt(b"m"), Err(SessionError::RotationRequired));

        cipher.rotate(key(11));
        assert_eq!(cipher.epoch(), 1);
        assert_eq!(cipher.message_count(), 0);
        let message = cipher.encrypt(b"after").unwrap();
        assert_eq!(cipher.decrypt(&message).unwrap(), b"after");
    }

    #[test]
    fn test_cipher_decrypt_rejects_old_key_after_rotation() {
        let mut cipher = SessionCipher::new(key(12), AeadAlgorithm::ChaCha20Poly1305);
        let before = cipher.encrypt(b"old").unwrap();
        cipher.rotate(key(13));
        assert_eq!(
            cipher.decrypt(&before),
            Err(SessionError::AuthenticationFailed)
        );
    }
}
