//! One-time-token certificate authority.
//!
//! A device proves it was provisioned by presenting its identity id and
//! one-time token together with the public key it wants certified. The CA
//! consumes the token atomically and signs
//!
//! ```text
//! identity_id (ASCII) || public_key (65 bytes) || "YYYY-MM-DD HH:MM:SS"
//! ```
//!
//! with its P-256 key. There is no revocation and no chain: a certificate is
//! trusted if the CA signature verifies and it has not expired.

use chrono::{DateTime, Duration, Utc};
use rollcall_core::config::CaConfig;
use rollcall_core::store::{EmployeeId, IdentityStore};
use rollcall_core::time::{format_wire, now_utc, parse_wire, truncate};
use rollcall_crypto::{key_id, sign, verify_with, PublicKeyBytes, SigningKeyPair};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use crate::error::{DenialReason, IdentityError, Result};

/// Longest identity id accepted at the boundary.
pub const MAX_IDENTITY_ID_LEN: usize = 32;

/// Longest one-time token accepted at the boundary.
pub const MAX_TOKEN_LEN: usize = 64;

/// Certificate binding an identity to a device public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    pub identity_id: String,
    pub public_key: PublicKeyBytes,
    /// UTC, whole seconds
    pub valid_until: DateTime<Utc>,
}

impl Certificate {
    /// The exact bytes the CA signs.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let valid_until = format_wire(&self.valid_until);
        let mut bytes =
            Vec::with_capacity(self.identity_id.len() + self.public_key.as_bytes().len() + valid_until.len());
        bytes.extend_from_slice(self.identity_id.as_bytes());
        bytes.extend_from_slice(self.public_key.as_bytes());
        bytes.extend_from_slice(valid_until.as_bytes());
        bytes
    }

    /// Expiry at whole-second precision, matching the wire format.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        truncate(now) > self.valid_until
    }
}

/// Output of a successful issuance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    pub certificate: Certificate,
    /// DER-encoded ECDSA signature over [`Certificate::signing_bytes`]
    pub signature: Vec<u8>,
    pub ca_public_key: PublicKeyBytes,
}

impl IssuedCertificate {
    /// Check against a trusted CA key. The embedded `ca_public_key` is
    /// informational and never trusted on its own.
    pub fn check(&self, trusted_ca: &PublicKeyBytes, now: DateTime<Utc>) -> Result<()> {
        check_certificate(&self.certificate, &self.signature, trusted_ca, now)
    }

    pub fn to_wire(&self) -> CertificateWire {
        CertificateWire {
            id: self.certificate.identity_id.clone(),
            pub_key: self.certificate.public_key.to_hex(),
            valid_until: format_wire(&self.certificate.valid_until),
            signature: hex::encode_upper(&self.signature),
            ca_pub: self.ca_public_key.to_hex(),
        }
    }

    pub fn from_wire(wire: &CertificateWire) -> Result<Self> {
        validate_identity_id(&wire.id)?;
        let public_key = PublicKeyBytes::from_hex(&wire.pub_key)
            .map_err(|e| IdentityError::InvalidRequest(format!("pub_key: {}", e)))?;
        let valid_until = parse_wire(&wire.valid_until).ok_or_else(|| {
            IdentityError::InvalidRequest(format!("valid_until: malformed {:?}", wire.valid_until))
        })?;
        let signature = hex::decode(&wire.signature)
            .map_err(|e| IdentityError::InvalidRequest(format!("signature: {}", e)))?;
        let ca_public_key = PublicKeyBytes::from_hex(&wire.ca_pub)
            .map_err(|e| IdentityError::InvalidRequest(format!("ca_pub: {}", e)))?;

        Ok(Self {
            certificate: Certificate {
                identity_id: wire.id.clone(),
                public_key,
                valid_until,
            },
            signature,
            ca_public_key,
        })
    }
}

/// Transport form of an issued certificate. Byte fields are uppercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateWire {
    pub id: String,
    pub pub_key: String,
    pub valid_until: String,
    pub signature: String,
    pub ca_pub: String,
}

/// Validated issuance request.
#[derive(Clone, PartialEq, Eq)]
pub struct IssueRequest {
    identity_id: String,
    token: String,
    public_key: PublicKeyBytes,
}

impl IssueRequest {
    pub fn new(
        identity_id: impl Into<String>,
        token: impl Into<String>,
        public_key: &[u8],
    ) -> Result<Self> {
        let identity_id = identity_id.into();
        let token = token.into();
        validate_identity_id(&identity_id)?;
        validate_token(&token)?;
        let public_key = PublicKeyBytes::from_slice(public_key)
            .map_err(|e| IdentityError::InvalidRequest(format!("public key: {}", e)))?;
        Ok(Self {
            identity_id,
            token,
            public_key,
        })
    }

    pub fn from_wire(wire: &IssueRequestWire) -> Result<Self> {
        let public_key = PublicKeyBytes::from_hex(&wire.pub_key)
            .map_err(|e| IdentityError::InvalidRequest(format!("pub_key: {}", e)))?;
        Self::new(wire.id.clone(), wire.token.clone(), public_key.as_bytes())
    }

    pub fn identity_id(&self) -> &str {
        &self.identity_id
    }

    pub fn public_key(&self) -> &PublicKeyBytes {
        &self.public_key
    }
}

impl std::fmt::Debug for IssueRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssueRequest")
            .field("identity_id", &self.identity_id)
            .field("public_key", &key_id(&self.public_key))
            .finish_non_exhaustive()
    }
}

/// Issuance request as it arrives from a device.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueRequestWire {
    pub id: String,
    pub token: String,
    pub pub_key: String,
}

impl std::fmt::Debug for IssueRequestWire {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssueRequestWire")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Identity ids are 1..=32 printable ASCII characters without whitespace.
pub fn validate_identity_id(identity_id: &str) -> Result<()> {
    if identity_id.is_empty() || identity_id.len() > MAX_IDENTITY_ID_LEN {
        return Err(IdentityError::InvalidRequest(format!(
            "identity id must be 1..={} characters",
            MAX_IDENTITY_ID_LEN
        )));
    }
    if !identity_id.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(IdentityError::InvalidRequest(
            "identity id must be printable ASCII without whitespace".to_string(),
        ));
    }
    Ok(())
}

pub(crate) fn validate_token(token: &str) -> Result<()> {
    if token.is_empty() || token.len() > MAX_TOKEN_LEN {
        return Err(IdentityError::InvalidRequest(format!(
            "token must be 1..={} characters",
            MAX_TOKEN_LEN
        )));
    }
    if !token.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(IdentityError::InvalidRequest(
            "token must be printable ASCII without whitespace".to_string(),
        ));
    }
    Ok(())
}

/// Verify signature and expiry; `false` on any failure.
pub fn verify_certificate(
    certificate: &Certificate,
    signature: &[u8],
    ca_public_key: &PublicKeyBytes,
    now: DateTime<Utc>,
) -> bool {
    check_certificate(certificate, signature, ca_public_key, now).is_ok()
}

/// [`verify_certificate`] with the failure reason. The signature is checked
/// first so a forged certificate never reports as merely expired.
pub fn check_certificate(
    certificate: &Certificate,
    signature: &[u8],
    ca_public_key: &PublicKeyBytes,
    now: DateTime<Utc>,
) -> Result<()> {
    if !verify_with(&certificate.signing_bytes(), ca_public_key, signature) {
        return Err(IdentityError::SignatureInvalid);
    }
    if certificate.is_expired_at(now) {
        return Err(IdentityError::ExpiredCertificate);
    }
    Ok(())
}

/// Confirm `certificate` is the one issued for its identity and return the
/// bound employee. Run after signature verification to reject certificates
/// for keys the store does not know.
pub fn resolve_employee<S: IdentityStore + ?Sized>(
    store: &S,
    certificate: &Certificate,
) -> Result<EmployeeId> {
    let pending = store
        .get_pending_identity(&certificate.identity_id)?
        .filter(|p| p.issued)
        .ok_or_else(|| {
            IdentityError::InvalidRequest(format!(
                "identity {} has no issued certificate",
                certificate.identity_id
            ))
        })?;

    let key_matches = pending
        .public_key
        .as_deref()
        .is_some_and(|stored| stored == certificate.public_key.as_bytes().as_slice());
    if !key_matches {
        return Err(IdentityError::InvalidRequest(format!(
            "certificate key does not match issued key for {}",
            certificate.identity_id
        )));
    }
    Ok(pending.employee_id)
}

/// Certificate authority issuing one certificate per provisioned identity.
pub struct CertificateAuthority<S> {
    key: Arc<SigningKeyPair>,
    store: S,
    validity: Duration,
}

impl<S: IdentityStore> CertificateAuthority<S> {
    /// Create a CA issuing certificates valid for `validity` after issuance.
    pub fn new(key: Arc<SigningKeyPair>, store: S, validity: Duration) -> Self {
        Self {
            key,
            store,
            validity,
        }
    }

    pub fn from_config(key: Arc<SigningKeyPair>, store: S, config: &CaConfig) -> Result<Self> {
        let validity = i64::try_from(config.validity_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .ok_or_else(|| {
                IdentityError::InvalidRequest(format!(
                    "ca.validity_secs {} is out of range",
                    config.validity_secs
                ))
            })?;
        Ok(Self::new(key, store, validity))
    }

    pub fn ca_public_key(&self) -> PublicKeyBytes {
        self.key.public_key()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Issue a certificate, consuming the identity's one-time token.
    pub fn issue(&self, request: &IssueRequest) -> Result<IssuedCertificate> {
        self.issue_at(request, now_utc())
    }

    /// [`CertificateAuthority::issue`] at an explicit instant.
    pub fn issue_at(&self, request: &IssueRequest, now: DateTime<Utc>) -> Result<IssuedCertificate> {
        let identity_id = request.identity_id.as_str();

        let pending = match self.store.get_pending_identity(identity_id)? {
            Some(pending) => pending,
            None => return Err(self.deny(identity_id, DenialReason::UnknownIdentity)),
        };

        let token_matches: bool = pending
            .one_time_token
            .as_bytes()
            .ct_eq(request.token.as_bytes())
            .into();
        if !token_matches {
            return Err(self.deny(identity_id, DenialReason::TokenMismatch));
        }
        if pending.issued {
            return Err(self.deny(identity_id, DenialReason::AlreadyIssued));
        }

        let valid_until = truncate(now)
            .checked_add_signed(self.validity)
            .ok_or_else(|| IdentityError::InvalidRequest("validity overflows".to_string()))?;

        if !self
            .store
            .mark_issued(identity_id, request.public_key.as_bytes(), valid_until)?
        {
            return Err(self.deny(identity_id, DenialReason::AlreadyIssued));
        }

        let certificate = Certificate {
            identity_id: identity_id.to_string(),
            public_key: request.public_key,
            valid_until,
        };
        let signature = sign(&self.key, &certificate.signing_bytes());

        info!(
            identity_id = %identity_id,
            employee_id = pending.employee_id,
            key_id = %key_id(&request.public_key),
            valid_until = %format_wire(&valid_until),
            "Certificate issued"
        );

        Ok(IssuedCertificate {
            certificate,
            signature,
            ca_public_key: self.key.public_key(),
        })
    }

    /// See [`resolve_employee`].
    pub fn resolve_employee(&self, certificate: &Certificate) -> Result<EmployeeId> {
        resolve_employee(&self.store, certificate)
    }

    fn deny(&self, identity_id: &str, reason: DenialReason) -> IdentityError {
        warn!(
            identity_id = %identity_id,
            reason = reason.as_str(),
            "Certificate issuance denied"
        );
        IdentityError::Denied(reason)
    }
}

impl<S> std::fmt::Debug for CertificateAuthority<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("ca_key_id", &key_id(&self.key.public_key()))
            .field("validity_secs", &self.validity.num_seconds())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rollcall_core::store::{MemoryStore, PendingIdentity};

    fn at(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 3, hour, minute, second).unwrap()
    }

    fn ca_with(validity: Duration) -> (CertificateAuthority<MemoryStore>, SigningKeyPair) {
        let store = MemoryStore::new();
        store
            .insert_pending(PendingIdentity::new("EMP01", "T0K001", 1))
            .unwrap();
        let ca = CertificateAuthority::new(Arc::new(SigningKeyPair::generate()), store, validity);
        (ca, SigningKeyPair::generate())
    }

    fn request(device: &SigningKeyPair, token: &str) -> IssueRequest {
        IssueRequest::new("EMP01", token, device.public_key().as_bytes()).unwrap()
    }

    #[test]
    fn test_issue_once_then_denied() {
        let (ca, device) = ca_with(Duration::days(30));
        let now = at(8, 0, 0);

        let issued = ca.issue_at(&request(&device, "T0K001"), now).unwrap();
        assert_eq!(issued.certificate.identity_id, "EMP01");
        assert_eq!(issued.certificate.valid_until, now + Duration::days(30));
        assert_eq!(issued.ca_public_key, ca.ca_public_key());
        assert!(issued.check(&ca.ca_public_key(), now).is_ok());

        let again = ca.issue_at(&request(&device, "T0K001"), now).unwrap_err();
        assert_eq!(again.denial_reason(), Some(DenialReason::AlreadyIssued));
        assert_eq!(again.to_string(), "issuance denied");
    }

    #[test]
    fn test_wrong_token_does_not_consume() {
        let (ca, device) = ca_with(Duration::days(1));
        let now = at(8, 0, 0);

        let err = ca.issue_at(&request(&device, "WRONG1"), now).unwrap_err();
        assert_eq!(err.denial_reason(), Some(DenialReason::TokenMismatch));

        let pending = ca.store().get_pending_identity("EMP01").unwrap().unwrap();
        assert!(!pending.issued);
        assert!(ca.issue_at(&request(&device, "T0K001"), now).is_ok());
    }

    #[test]
    fn test_unknown_identity_denied() {
        let (ca, device) = ca_with(Duration::days(1));
        let req = IssueRequest::new("EMP99", "T0K001", device.public_key().as_bytes()).unwrap();
        let err = ca.issue_at(&req, at(8, 0, 0)).unwrap_err();
        assert_eq!(err.denial_reason(), Some(DenialReason::UnknownIdentity));
        assert_eq!(err.to_string(), "issuance denied");
    }

    #[test]
    fn test_zero_validity_expires_immediately() {
        let (ca, device) = ca_with(Duration::zero());
        let now = at(8, 0, 0);
        let issued = ca.issue_at(&request(&device, "T0K001"), now).unwrap();

        assert_eq!(issued.certificate.valid_until, now);
        assert!(issued.check(&ca.ca_public_key(), now).is_ok());
        assert!(issued
            .check(&ca.ca_public_key(), now + Duration::milliseconds(500))
            .is_ok());
        assert!(matches!(
            issued.check(&ca.ca_public_key(), now + Duration::seconds(1)),
            Err(IdentityError::ExpiredCertificate)
        ));
    }

    #[test]
    fn test_subsecond_issuance_truncated() {
        let (ca, device) = ca_with(Duration::seconds(60));
        let now = at(8, 0, 0) + Duration::milliseconds(750);
        let issued = ca.issue_at(&request(&device, "T0K001"), now).unwrap();
        assert_eq!(issued.certificate.valid_until, at(8, 1, 0));
    }

    #[test]
    fn test_tampered_certificate_fails_signature() {
        let (ca, device) = ca_with(Duration::days(1));
        let now = at(8, 0, 0);
        let issued = ca.issue_at(&request(&device, "T0K001"), now).unwrap();
        let ca_key = ca.ca_public_key();

        let mut renamed = issued.certificate.clone();
        renamed.identity_id = "EMP02".to_string();
        assert!(!verify_certificate(&renamed, &issued.signature, &ca_key, now));

        let mut extended = issued.certificate.clone();
        extended.valid_until += Duration::days(365);
        assert!(matches!(
            check_certificate(&extended, &issued.signature, &ca_key, now),
            Err(IdentityError::SignatureInvalid)
        ));

        let mut rekeyed = issued.certificate.clone();
        rekeyed.public_key = SigningKeyPair::generate().public_key();
        assert!(!verify_certificate(&rekeyed, &issued.signature, &ca_key, now));

        let other_ca = SigningKeyPair::generate().public_key();
        assert!(!verify_certificate(&issued.certificate, &issued.signature, &other_ca, now));
    }

    #[test]
    fn test_expired_and_forged_reports_signature() {
        let (ca, device) = ca_with(Duration::zero());
        let now = at(8, 0, 0);
        let issued = ca.issue_at(&request(&device, "T0K001"), now).unwrap();

        let mut forged = issued.certificate.clone();
        forged.identity_id = "EMP02".to_string();
        assert!(matches!(
            check_certificate(&forged, &issued.signature, &ca.ca_public_key(), now + Duration::days(1)),
            Err(IdentityError::SignatureInvalid)
        ));
    }

    #[test]
    fn test_wire_round_trip() {
        let (ca, device) = ca_with(Duration::days(1));
        let issued = ca.issue_at(&request(&device, "T0K001"), at(8, 0, 0)).unwrap();

        let wire = issued.to_wire();
        assert_eq!(wire.valid_until, "2025-06-04 08:00:00");
        assert_eq!(wire.signature, wire.signature.to_uppercase());
        assert_eq!(wire.ca_pub, ca.ca_public_key().to_hex());

        let json = serde_json::to_string(&wire).unwrap();
        let parsed: CertificateWire = serde_json::from_str(&json).unwrap();
        assert_eq!(IssuedCertificate::from_wire(&parsed).unwrap(), issued);
    }

    #[test]
    fn test_wire_rejects_malformed_fields() {
        let (ca, device) = ca_with(Duration::days(1));
        let wire = ca
            .issue_at(&request(&device, "T0K001"), at(8, 0, 0))
            .unwrap()
            .to_wire();

        let bad_time = CertificateWire {
            valid_until: "2025-06-04T08:00:00Z".to_string(),
            ..wire.clone()
        };
        assert!(matches!(
            IssuedCertificate::from_wire(&bad_time),
            Err(IdentityError::InvalidRequest(_))
        ));

        let bad_key = CertificateWire {
            pub_key: "04ABCD".to_string(),
            ..wire.clone()
        };
        assert!(IssuedCertificate::from_wire(&bad_key).is_err());

        let bad_sig = CertificateWire {
            signature: "ZZ".to_string(),
            ..wire
        };
        assert!(IssuedCertificate::from_wire(&bad_sig).is_err());
    }

    #[test]
    fn test_request_validation() {
        let key = SigningKeyPair::generate().public_key();

        assert!(IssueRequest::new("", "T0K001", key.as_bytes()).is_err());
        assert!(IssueRequest::new("EMP 01", "T0K001", key.as_bytes()).is_err());
        assert!(IssueRequest::new("E".repeat(33), "T0K001", key.as_bytes()).is_err());
        assert!(IssueRequest::new("EMP01", "", key.as_bytes()).is_err());
        assert!(IssueRequest::new("EMP01", "T0K001", &key.as_bytes()[..64]).is_err());
        assert!(IssueRequest::new("E".repeat(32), "T0K001", key.as_bytes()).is_ok());

        let wire = IssueRequestWire {
            id: "EMP01".to_string(),
            token: "T0K001".to_string(),
            pub_key: key.to_hex(),
        };
        let req = IssueRequest::from_wire(&wire).unwrap();
        assert_eq!(req.identity_id(), "EMP01");
        assert_eq!(req.public_key(), &key);
        assert!(!format!("{:?}", req).contains("T0K001"));
        assert!(!format!("{:?}", wire).contains("T0K001"));
    }

    #[test]
    fn test_resolve_employee_requires_matching_key() {
        let (ca, device) = ca_with(Duration::days(1));
        let now = at(8, 0, 0);
        let issued = ca.issue_at(&request(&device, "T0K001"), now).unwrap();

        assert_eq!(ca.resolve_employee(&issued.certificate).unwrap(), 1);

        let mut other_key = issued.certificate.clone();
        other_key.public_key = SigningKeyPair::generate().public_key();
        assert!(ca.resolve_employee(&other_key).is_err());
    }

    #[test]
    fn test_from_config_uses_validity_secs() {
        let store = MemoryStore::new();
        let config = CaConfig {
            validity_secs: 3600,
            ..CaConfig::default()
        };
        let ca = CertificateAuthority::from_config(Arc::new(SigningKeyPair::generate()), store, &config)
            .unwrap();
        assert_eq!(ca.validity.num_seconds(), 3600);

        let huge = CaConfig {
            validity_secs: u64::MAX,
            ..CaConfig::default()
        };
        assert!(CertificateAuthority::from_config(
            Arc::new(SigningKeyPair::generate()),
            MemoryStore::new(),
            &huge
        )
        .is_err());
    }
}
