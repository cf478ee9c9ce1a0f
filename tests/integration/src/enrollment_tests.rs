//! Provisioning and certificate issuance, end to end over SQLite.

use crate::test_utils::{at, Deployment};
use chrono::Duration;
use rollcall_core::store::IdentityStore;
use rollcall_core::Config;
use rollcall_crypto::SigningKeyPair;
use rollcall_identity::{
    verify_certificate, CertificateWire, DenialReason, IdentityError, IssueRequest,
    IssuedCertificate, Provisioner,
};
use std::sync::Arc;

fn provision(deployment: &Deployment, identity_id: &str, employee_id: i64, token: &str) {
    Provisioner::new(Arc::clone(&deployment.store))
        .provision(identity_id, employee_id, Some(token.to_string()))
        .unwrap();
}

#[test]
fn test_zero_validity_certificate_expires_at_issuance() {
    let _ = tracing_subscriber::fmt::try_init();

    let config = Config::from_toml_str("[ca]\nvalidity_secs = 0\n").unwrap();
    let deployment = Deployment::new(&config);
    provision(&deployment, "EMP01", 1, "T0K001");

    let device = SigningKeyPair::generate();
    let request = IssueRequest::new("EMP01", "T0K001", device.public_key().as_bytes()).unwrap();
    let issued_at = at(9, 15, 0);
    let issued = deployment.ca.issue_at(&request, issued_at).unwrap();

    assert_eq!(issued.certificate.valid_until, issued_at);
    assert_eq!(issued.ca_public_key, deployment.ca.ca_public_key());

    let ca_pub = deployment.ca.ca_public_key();
    assert!(verify_certificate(&issued.certificate, &issued.signature, &ca_pub, issued_at));
    assert!(!verify_certificate(
        &issued.certificate,
        &issued.signature,
        &ca_pub,
        issued_at + Duration::seconds(1)
    ));

    // The token is spent; the same request is now refused.
    let again = deployment.ca.issue_at(&request, issued_at).unwrap_err();
    assert!(matches!(again, IdentityError::Denied(DenialReason::AlreadyIssued)));
    assert_eq!(again.to_string(), "issuance denied");

    let pending = deployment.store.get_pending_identity("EMP01").unwrap().unwrap();
    assert!(pending.issued);
    assert_eq!(pending.public_key.as_deref(), Some(device.public_key().as_bytes().as_slice()));
    assert_eq!(pending.valid_until, Some(issued_at));
}

#[test]
fn test_wrong_token_leaves_identity_redeemable() {
    let deployment = Deployment::new(&Config::default_config());
    provision(&deployment, "EMP02", 2, "T0K002");

    let device = SigningKeyPair::generate();
    let wrong = IssueRequest::new("EMP02", "T0K999", device.public_key().as_bytes()).unwrap();
    let err = deployment.ca.issue_at(&wrong, at(9, 0, 0)).unwrap_err();
    assert_eq!(err.denial_reason(), Some(DenialReason::TokenMismatch));
    assert_eq!(err.to_string(), "issuance denied");

    let right = IssueRequest::new("EMP02", "T0K002", device.public_key().as_bytes()).unwrap();
    let issued = deployment.ca.issue_at(&right, at(9, 0, 5)).unwrap();
    assert_eq!(issued.certificate.valid_until, at(9, 0, 5) + Duration::days(30));
}

#[test]
fn test_unknown_identity_denied() {
    let deployment = Deployment::new(&Config::default_config());
    let device = SigningKeyPair::generate();
    let request = IssueRequest::new("GHOST", "T0K000", device.public_key().as_bytes()).unwrap();

    let err = deployment.ca.issue_at(&request, at(9, 0, 0)).unwrap_err();
    assert_eq!(err.denial_reason(), Some(DenialReason::UnknownIdentity));
}

#[test]
fn test_certificate_survives_transport_as_json() {
    let deployment = Deployment::new(&Config::default_config());
    let device = deployment.enroll("EMP03", 3, at(7, 30, 0));

    let json = serde_json::to_string(&device.certificate.to_wire()).unwrap();
    let wire: CertificateWire = serde_json::from_str(&json).unwrap();
    assert!(wire
        .pub_key
        .chars()
        .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
    assert_eq!(wire.valid_until, "2025-07-03 07:30:00");

    let received = IssuedCertificate::from_wire(&wire).unwrap();
    assert_eq!(received, device.certificate);
    assert!(received
        .check(&deployment.ca.ca_public_key(), at(12, 0, 0))
        .is_ok());
}
