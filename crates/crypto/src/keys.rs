//! Cryptographic key management
//!
//! All keys live on NIST P-256. Public points travel as 65-byte uncompressed
//! SEC1 encodings (`0x04 || X || Y`), rendered as uppercase hex on the wire.

use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::{DecodePrivateKey, LineEnding};
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use zeroize::Zeroizing;

/// Length of an uncompressed SEC1 P-256 point.
pub const PUBLIC_KEY_LEN: usize = 65;

const UNCOMPRESSED_TAG: u8 = 0x04;

/// Key loading and decoding errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),
}

/// A validated P-256 public point in uncompressed SEC1 form.
///
/// Construction fails unless the bytes carry the uncompressed tag and
/// decode to a point on the curve, so holders never need to re-check.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKeyBytes([u8; PUBLIC_KEY_LEN]);

impl PublicKeyBytes {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() != PUBLIC_KEY_LEN {
            return Err(KeyError::InvalidPublicKey(format!(
                "expected {} bytes, got {}",
                PUBLIC_KEY_LEN,
                bytes.len()
            )));
        }
        if bytes[0] != UNCOMPRESSED_TAG {
            return Err(KeyError::InvalidPublicKey(format!(
                "expected uncompressed tag 0x04, got 0x{:02x}",
                bytes[0]
            )));
        }
        PublicKey::from_sec1_bytes(bytes)
            .map_err(|_| KeyError::InvalidPublicKey("point is not on P-256".to_string()))?;

        let mut out = [0u8; PUBLIC_KEY_LEN];
        out.copy_from_slice(bytes);
        Ok(Self(out))
    }

    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let bytes =
            hex::decode(s.trim()).map_err(|e| KeyError::InvalidPublicKey(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    /// Uppercase hex, the wire form.
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    pub(crate) fn to_point(self) -> Result<PublicKey, KeyError> {
        PublicKey::from_sec1_bytes(&self.0)
            .map_err(|_| KeyError::InvalidPublicKey("point is not on P-256".to_string()))
    }

    fn from_point(point: &PublicKey) -> Self {
        let encoded = point.to_encoded_point(false);
        let mut out = [0u8; PUBLIC_KEY_LEN];
        out.copy_from_slice(encoded.as_bytes());
        Self(out)
    }
}

impl AsRef<[u8]> for PublicKeyBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for PublicKeyBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKeyBytes({})", self.to_hex())
    }
}

impl fmt::Display for PublicKeyBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for PublicKeyBytes {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl TryFrom<&[u8]> for PublicKeyBytes {
    type Error = KeyError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        Self::from_slice(bytes)
    }
}

impl Serialize for PublicKeyBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKeyBytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Long-term ECDSA signing key (CA key, device identity key).
///
/// The secret scalar is zeroized on drop and only leaves the process through
/// [`SigningKeyPair::to_pem`].
pub struct SigningKeyPair {
    secret: SecretKey,
    signing: p256::ecdsa::SigningKey,
    public: PublicKeyBytes,
}

impl SigningKeyPair {
    /// Generate a fresh key from the OS CSPRNG.
    pub fn generate() -> Self {
        Self::from_secret(SecretKey::random(&mut OsRng))
    }

    /// Load a PEM private key. Accepts SEC1 (`EC PRIVATE KEY`) and PKCS#8
    /// (`PRIVATE KEY`) encodings; anything not on P-256 is rejected.
    pub fn from_pem(pem: &str) -> Result<Self, KeyError> {
        let secret = SecretKey::from_sec1_pem(pem)
            .or_else(|_| SecretKey::from_pkcs8_pem(pem))
            .map_err(|e| KeyError::InvalidPrivateKey(e.to_string()))?;
        Ok(Self::from_secret(secret))
    }

    /// Export as SEC1 PEM.
    pub fn to_pem(&self) -> Result<Zeroizing<String>, KeyError> {
        self.secret
            .to_sec1_pem(LineEnding::LF)
            .map_err(|e| KeyError::InvalidPrivateKey(e.to_string()))
    }

    pub fn public_key(&self) -> PublicKeyBytes {
        self.public
    }

    pub(crate) fn signing_key(&self) -> &p256::ecdsa::SigningKey {
        &self.signing
    }

    fn from_secret(secret: SecretKey) -> Self {
        let signing = p256::ecdsa::SigningKey::from(&secret);
        let public = PublicKeyBytes::from_point(&secret.public_key());
        Self {
            secret,
            signing,
            public,
        }
    }
}

impl fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKeyPair")
            .field("key_id", &crate::signing::key_id(&self.public))
            .finish_non_exhaustive()
    }
}

/// Ephemeral ECDH key pair for one session key derivation.
pub struct AgreementKeyPair {
    secret: EphemeralSecret,
    public: PublicKeyBytes,
}

impl AgreementKeyPair {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random(&mut OsRng);
        let public = PublicKeyBytes::from_point(&secret.public_key());
        Self { secret, public }
    }

    /// Public point sent to the peer.
    pub fn public_bytes(&self) -> PublicKeyBytes {
        self.public
    }

    pub(crate) fn secret(&self) -> &EphemeralSecret {
        &self.secret
    }
}

impl fmt::Debug for AgreementKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgreementKeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}
