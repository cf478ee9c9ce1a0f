//! Mutual session handshake between two certificate holders.
//!
//! The initiator (badge, terminal) and the responder (server) each prove
//! possession of a certified key by signing a transcript that binds the
//! other side's nonce to both ephemeral agreement keys. Once both signatures
//! check out, each side derives the same session key via ECDH + HKDF.
//!
//! # Protocol Flow
//!
//! 1. Initiator → Responder: [`Hello`] (certificate, client nonce, client session key)
//! 2. Responder → Initiator: [`Reply`] (certificate, server nonce, server session key,
//!    signature over `client_nonce || client_pub || server_pub`)
//! 3. Initiator → Responder: [`Finish`] (signature over `server_nonce || client_pub || server_pub`)
//!
//! # Timing Constraints
//!
//! - A pending handshake must finish within the configured timeout (30 s default)
//! - A pending handshake is consumed by its first successful [`Finish`];
//!   replays find nothing and fail with [`HandshakeError::UnknownSession`]

use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use rollcall_core::config::{AeadAlgorithm, SessionConfig};
use rollcall_crypto::{
    derive_shared_key, key_id, sign, verify_with, AgreementKeyPair, PublicKeyBytes, SessionCipher,
    SessionKey, SigningKeyPair, NONCE_SIZE,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use crate::error::HandshakeError;
use crate::pki::{Certificate, CertificateWire, IssuedCertificate};

/// Handshake nonce length.
pub const HANDSHAKE_NONCE_LEN: usize = 12;

/// Transcript length: nonce plus two uncompressed points.
pub const TRANSCRIPT_LEN: usize = HANDSHAKE_NONCE_LEN + 2 * rollcall_crypto::PUBLIC_KEY_LEN;

type HandshakeResult<T> = Result<T, HandshakeError>;

/// Handshake request (step 1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub certificate: CertificateWire,
    #[serde(with = "rollcall_crypto::hex_serde::array")]
    pub client_nonce: [u8; HANDSHAKE_NONCE_LEN],
    pub client_session_pub: PublicKeyBytes,
}

/// Handshake response (step 2).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub certificate: CertificateWire,
    #[serde(with = "rollcall_crypto::hex_serde::array")]
    pub server_nonce: [u8; HANDSHAKE_NONCE_LEN],
    pub server_session_pub: PublicKeyBytes,
    #[serde(with = "rollcall_crypto::hex_serde::bytes")]
    pub session_signature: Vec<u8>,
}

/// Handshake finalization (step 3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finish {
    pub identity_id: String,
    #[serde(with = "rollcall_crypto::hex_serde::bytes")]
    pub session_signature: Vec<u8>,
}

/// Bytes each side signs to prove key possession for this handshake.
pub fn transcript(
    nonce: &[u8; HANDSHAKE_NONCE_LEN],
    client_pub: &PublicKeyBytes,
    server_pub: &PublicKeyBytes,
) -> [u8; TRANSCRIPT_LEN] {
    let mut out = [0u8; TRANSCRIPT_LEN];
    let (n, rest) = out.split_at_mut(HANDSHAKE_NONCE_LEN);
    let (c, s) = rest.split_at_mut(rollcall_crypto::PUBLIC_KEY_LEN);
    n.copy_from_slice(nonce);
    c.copy_from_slice(client_pub.as_bytes());
    s.copy_from_slice(server_pub.as_bytes());
    out
}

/// A certificate together with the private key it certifies.
#[derive(Clone)]
pub struct Credentials {
    certificate: IssuedCertificate,
    key: Arc<SigningKeyPair>,
}

impl Credentials {
    pub fn new(certificate: IssuedCertificate, key: Arc<SigningKeyPair>) -> HandshakeResult<Self> {
        if certificate.certificate.public_key != key.public_key() {
            return Err(HandshakeError::CertificateRejected(
                "certificate does not certify this key".to_string(),
            ));
        }
        Ok(Self { certificate, key })
    }

    pub fn identity_id(&self) -> &str {
        &self.certificate.certificate.identity_id
    }

    pub fn certificate(&self) -> &IssuedCertificate {
        &self.certificate
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("identity_id", &self.identity_id())
            .field("key_id", &key_id(&self.key.public_key()))
            .finish()
    }
}

/// Result of a completed handshake on either side.
pub struct EstablishedSession {
    /// The authenticated peer
    pub peer: Certificate,
    session_key: SessionKey,
    /// AEAD nonces already accepted under this session key
    seen_nonces: Mutex<HashSet<[u8; NONCE_SIZE]>>,
}

impl EstablishedSession {
    fn new(peer: Certificate, session_key: SessionKey) -> Self {
        Self {
            peer,
            session_key,
            seen_nonces: Mutex::new(HashSet::new()),
        }
    }

    pub fn session_key(&self) -> &SessionKey {
        &self.session_key
    }

    /// Record `nonce` as used. Returns false if it was already accepted on
    /// this session, i.e. the message is a replay.
    pub fn admit_nonce(&self, nonce: &[u8; NONCE_SIZE]) -> bool {
        self.seen_nonces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(*nonce)
    }

    /// Session cipher over the agreed key.
    pub fn cipher(&self, algorithm: AeadAlgorithm) -> SessionCipher {
        SessionCipher::new(self.session_key.clone(), algorithm)
    }
}

impl std::fmt::Debug for EstablishedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EstablishedSession")
            .field("peer", &self.peer.identity_id)
            .finish_non_exhaustive()
    }
}

fn random_nonce() -> [u8; HANDSHAKE_NONCE_LEN] {
    let mut nonce = [0u8; HANDSHAKE_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

fn accept_certificate(
    wire: &CertificateWire,
    trusted_ca: &PublicKeyBytes,
    now: DateTime<Utc>,
) -> HandshakeResult<Certificate> {
    let issued = IssuedCertificate::from_wire(wire)
        .map_err(|e| HandshakeError::CertificateRejected(e.to_string()))?;
    issued
        .check(trusted_ca, now)
        .map_err(|e| HandshakeError::CertificateRejected(e.to_string()))?;
    Ok(issued.certificate)
}

/// Initiator side, between sending [`Hello`] and receiving [`Reply`].
pub struct Initiator {
    credentials: Credentials,
    trusted_ca: PublicKeyBytes,
    client_nonce: [u8; HANDSHAKE_NONCE_LEN],
    agreement: AgreementKeyPair,
}

impl Initiator {
    /// Start a handshake and produce the [`Hello`] to send.
    pub fn start(credentials: Credentials, trusted_ca: PublicKeyBytes) -> (Self, Hello) {
        let agreement = AgreementKeyPair::generate();
        let client_nonce = random_nonce();
        let hello = Hello {
            certificate: credentials.certificate.to_wire(),
            client_nonce,
            client_session_pub: agreement.public_bytes(),
        };
        (
            Self {
                credentials,
                trusted_ca,
                client_nonce,
                agreement,
            },
            hello,
        )
    }

    /// Verify the responder and produce the [`Finish`] message.
    pub fn finish(
        self,
        reply: &Reply,
        now: DateTime<Utc>,
    ) -> HandshakeResult<(Finish, EstablishedSession)> {
        let peer = accept_certificate(&reply.certificate, &self.trusted_ca, now)?;

        let client_pub = self.agreement.public_bytes();
        let expected = transcript(&self.client_nonce, &client_pub, &reply.server_session_pub);
        if !verify_with(&expected, &peer.public_key, &reply.session_signature) {
            warn!(peer = %peer.identity_id, "Responder session signature invalid");
            return Err(HandshakeError::SignatureInvalid);
        }

        let session_key =
            derive_shared_key(&self.agreement, reply.server_session_pub.as_bytes())?;

        let ours = transcript(&reply.server_nonce, &client_pub, &reply.server_session_pub);
        let finish = Finish {
            identity_id: self.credentials.identity_id().to_string(),
            session_signature: sign(&self.credentials.key, &ours),
        };

        debug!(peer = %peer.identity_id, "Handshake finished by initiator");
        Ok((finish, EstablishedSession::new(peer, session_key)))
    }
}

struct PendingHandshake {
    peer: Certificate,
    client_session_pub: PublicKeyBytes,
    server_nonce: [u8; HANDSHAKE_NONCE_LEN],
    agreement: AgreementKeyPair,
    started_at: DateTime<Utc>,
}

/// Responder side. Shared between request handlers.
pub struct Responder {
    credentials: Credentials,
    trusted_ca: PublicKeyBytes,
    timeout: Duration,
    /// Pending handshakes keyed by initiator identity id
    pending: Mutex<HashMap<String, PendingHandshake>>,
}

impl Responder {
    pub fn new(credentials: Credentials, trusted_ca: PublicKeyBytes, timeout: Duration) -> Self {
        Self {
            credentials,
            trusted_ca,
            timeout,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(
        credentials: Credentials,
        trusted_ca: PublicKeyBytes,
        config: &SessionConfig,
    ) -> Self {
        let secs = i64::try_from(config.handshake_timeout_secs).unwrap_or(i64::MAX);
        let timeout = Duration::try_seconds(secs).unwrap_or(Duration::MAX);
        Self::new(credentials, trusted_ca, timeout)
    }

    fn lock(&self) -> HandshakeResult<MutexGuard<'_, HashMap<String, PendingHandshake>>> {
        self.pending
            .lock()
            .map_err(|_| HandshakeError::Unavailable("pending handshake lock poisoned".to_string()))
    }

    /// Handle a [`Hello`]. While a handshake for the same identity is pending
    /// and not expired, further hellos are refused with
    /// [`HandshakeError::InProgress`].
    pub fn respond(&self, hello: &Hello, now: DateTime<Utc>) -> HandshakeResult<Reply> {
        let peer = accept_certificate(&hello.certificate, &self.trusted_ca, now).map_err(|e| {
            warn!(identity_id = %hello.certificate.id, error = %e, "Handshake certificate rejected");
            e
        })?;

        let mut pending = self.lock()?;
        pending.retain(|_, p| now - p.started_at <= self.timeout);
        if pending.contains_key(&peer.identity_id) {
            warn!(identity_id = %peer.identity_id, "Handshake already pending");
            return Err(HandshakeError::InProgress);
        }

        let agreement = AgreementKeyPair::generate();
        let server_nonce = random_nonce();
        let server_session_pub = agreement.public_bytes();

        let signed = transcript(&hello.client_nonce, &hello.client_session_pub, &server_session_pub);
        let reply = Reply {
            certificate: self.credentials.certificate.to_wire(),
            server_nonce,
            server_session_pub,
            session_signature: sign(&self.credentials.key, &signed),
        };

        debug!(identity_id = %peer.identity_id, "Handshake pending");
        pending.insert(
            peer.identity_id.clone(),
            PendingHandshake {
                peer,
                client_session_pub: hello.client_session_pub,
                server_nonce,
                agreement,
                started_at: now,
            },
        );

        Ok(reply)
    }

    /// Handle a [`Finish`] and establish the session.
    pub fn complete(&self, finish: &Finish, now: DateTime<Utc>) -> HandshakeResult<EstablishedSession> {
        let mut pending = self.lock()?;

        let entry = pending
            .get(&finish.identity_id)
            .ok_or(HandshakeError::UnknownSession)?;

        if now - entry.started_at > self.timeout {
            pending.remove(&finish.identity_id);
            warn!(identity_id = %finish.identity_id, "Handshake expired");
            return Err(HandshakeError::Expired);
        }

        let server_pub = entry.agreement.public_bytes();
        let expected = transcript(&entry.server_nonce, &entry.client_session_pub, &server_pub);
        if !verify_with(&expected, &entry.peer.public_key, &finish.session_signature) {
            warn!(identity_id = %finish.identity_id, "Initiator session signature invalid");
            return Err(HandshakeError::SignatureInvalid);
        }

        let entry = pending
            .remove(&finish.identity_id)
            .ok_or(HandshakeError::UnknownSession)?;
        drop(pending);

        let session_key = derive_shared_key(&entry.agreement, entry.client_session_pub.as_bytes())?;

        info!(
            identity_id = %entry.peer.identity_id,
            key_id = %key_id(&entry.peer.public_key),
            "Session established"
        );
        Ok(EstablishedSession::new(entry.peer, session_key))
    }

    /// Number of handshakes awaiting [`Finish`].
    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("credentials", &self.credentials)
            .field("timeout_secs", &self.timeout.num_seconds())
            .finish_non_exhaustive()
    }
}
