//! Verified entry point for check-ins.
//!
//! [`CheckinGateway::check_in`] takes the device certificate as presented:
//! it must carry a valid signature from the configured CA, be unexpired, and
//! match the key the store holds as that identity's issued key. It does not
//! prove the caller holds the private key. Proof of possession comes from
//! [`CheckinGateway::check_in_sealed`], which only accepts messages sealed
//! under a key agreed in a signed handshake, each nonce at most once.
//!
//! The event time is the gateway's clock, never the device's.

use chrono::{DateTime, Utc};
use rollcall_core::config::AeadAlgorithm;
use rollcall_core::store::{CheckinStore, IdentityStore, SessionDirectory, SessionId};
use rollcall_crypto::{decrypt_with, AeadMessage, PublicKeyBytes};
use rollcall_identity::{
    resolve_employee, Certificate, CertificateWire, EstablishedSession, IdentityError,
    IssuedCertificate,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{CheckinError, Result};
use crate::machine::{CheckinOutcome, CheckinStateMachine};
use crate::policy::{ThresholdPolicy, TimelinessPolicy};

/// Plain check-in carrying the device certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckinRequest {
    pub certificate: CertificateWire,
    pub session_id: SessionId,
}

/// Body of a check-in sent over an established session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedCheckin {
    pub session_id: SessionId,
}

pub struct CheckinGateway<I, S, D, P = ThresholdPolicy> {
    identities: I,
    trusted_ca: PublicKeyBytes,
    machine: CheckinStateMachine<S, D, P>,
}

impl<I, S, D, P> CheckinGateway<I, S, D, P>
where
    I: IdentityStore,
    S: CheckinStore,
    D: SessionDirectory,
    P: TimelinessPolicy,
{
    pub fn new(identities: I, trusted_ca: PublicKeyBytes, machine: CheckinStateMachine<S, D, P>) -> Self {
        Self {
            identities,
            trusted_ca,
            machine,
        }
    }

    pub fn machine(&self) -> &CheckinStateMachine<S, D, P> {
        &self.machine
    }

    /// Verify the presented certificate and record the check-in at `now`.
    pub fn check_in(&self, request: &CheckinRequest, now: DateTime<Utc>) -> Result<CheckinOutcome> {
        let issued = IssuedCertificate::from_wire(&request.certificate).map_err(|e| {
            warn!(identity_id = %request.certificate.id, error = %e, "Malformed check-in certificate");
            CheckinError::Unauthenticated(e)
        })?;
        issued.check(&self.trusted_ca, now).map_err(|e| {
            warn!(identity_id = %request.certificate.id, error = %e, "Check-in certificate rejected");
            CheckinError::Unauthenticated(e)
        })?;

        self.record_for(&issued.certificate, request.session_id, now)
    }

    /// Decrypt a check-in sent over a handshake session and record it at
    /// `now`. The peer certificate was verified during the handshake; its
    /// expiry is checked again here. A message whose nonce was already
    /// accepted on this session is rejected as a replay.
    pub fn check_in_sealed(
        &self,
        session: &EstablishedSession,
        algorithm: AeadAlgorithm,
        message: &AeadMessage,
        now: DateTime<Utc>,
    ) -> Result<CheckinOutcome> {
        let plaintext = decrypt_with(algorithm, session.session_key(), message).map_err(|e| {
            warn!(identity_id = %session.peer.identity_id, "Sealed check-in failed to open");
            CheckinError::Sealed(e)
        })?;
        if !session.admit_nonce(&message.nonce) {
            warn!(identity_id = %session.peer.identity_id, "Replayed sealed check-in");
            return Err(CheckinError::Replayed);
        }
        let body: SealedCheckin = serde_json::from_slice(&plaintext)
            .map_err(|e| CheckinError::InvalidRequest(format!("sealed body: {}", e)))?;

        if session.peer.is_expired_at(now) {
            return Err(CheckinError::Unauthenticated(IdentityError::ExpiredCertificate));
        }
        self.record_for(&session.peer, body.session_id, now)
    }

    fn record_for(
        &self,
        certificate: &Certificate,
        session_id: SessionId,
        now: DateTime<Utc>,
    ) -> Result<CheckinOutcome> {
        let employee_id = resolve_employee(&self.identities, certificate).map_err(|e| {
            warn!(identity_id = %certificate.identity_id, error = %e, "Check-in identity not issued");
            CheckinError::Unauthenticated(e)
        })?;
        self.machine.record_event(employee_id, session_id, now)
    }
}
