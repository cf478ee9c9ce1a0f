//! Certificate-authenticated check-ins against the SQLite store.

use crate::test_utils::{at, Deployment};
use rollcall_checkin::{CheckinError, CheckinOutcome, CheckinRequest, SealedCheckin};
use rollcall_core::config::AeadAlgorithm;
use rollcall_core::store::{CheckStatus, CheckinStore, TimeSlot};
use rollcall_core::Config;
use rollcall_crypto::AeadMessage;
use rollcall_identity::{Credentials, Initiator, Responder};
use std::sync::Arc;

#[test]
fn test_status_follows_first_arrival_per_slot() {
    let _ = tracing_subscriber::fmt::try_init();

    let deployment = Deployment::new(&Config::default_config());
    deployment.add_session(1, TimeSlot::Morning, 5);
    deployment.add_session(2, TimeSlot::Afternoon, 5);
    deployment.add_session(3, TimeSlot::Evening, 5);
    let device = deployment.enroll("EMP05", 5, at(6, 0, 0));
    let certificate = device.certificate.to_wire();

    let request = |session_id| CheckinRequest {
        certificate: certificate.clone(),
        session_id,
    };

    let morning = deployment.gateway.check_in(&request(1), at(8, 4, 59)).unwrap();
    assert_eq!(morning.record().check_status, CheckStatus::OnTime);

    let afternoon = deployment.gateway.check_in(&request(2), at(13, 30, 0)).unwrap();
    assert_eq!(afternoon.record().check_status, CheckStatus::Late);

    let evening = deployment.gateway.check_in(&request(3), at(19, 0, 1)).unwrap();
    assert_eq!(evening.record().check_status, CheckStatus::Absent);

    // A later morning ping refreshes last-seen without touching the status.
    let refreshed = deployment.gateway.check_in(&request(1), at(11, 0, 0)).unwrap();
    match refreshed {
        CheckinOutcome::Updated { record, advanced } => {
            assert!(advanced);
            assert_eq!(record.first_checkin_time, at(8, 4, 59));
            assert_eq!(record.last_checkin_time, at(11, 0, 0));
            assert_eq!(record.check_status, CheckStatus::OnTime);
        }
        other => panic!("expected update, got {:?}", other),
    }

    let history = deployment.gateway.machine().history(5).unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(
        history.iter().map(|r| r.session_id).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
}

#[test]
fn test_repeated_checkin_is_idempotent() {
    let deployment = Deployment::new(&Config::default_config());
    deployment.add_session(1, TimeSlot::Morning, 6);
    let device = deployment.enroll("EMP06", 6, at(6, 0, 0));
    let request = CheckinRequest {
        certificate: device.certificate.to_wire(),
        session_id: 1,
    };

    assert!(deployment.gateway.check_in(&request, at(8, 0, 0)).unwrap().is_created());
    for _ in 0..3 {
        let outcome = deployment.gateway.check_in(&request, at(8, 0, 0)).unwrap();
        assert!(matches!(outcome, CheckinOutcome::Updated { advanced: false, .. }));
    }

    let records = deployment.store.list_records(6).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].first_checkin_time, records[0].last_checkin_time);
}

#[test]
fn test_checkin_outside_session_day_leaves_no_record() {
    let deployment = Deployment::new(&Config::default_config());
    deployment.add_session(1, TimeSlot::Morning, 11);
    let device = deployment.enroll("EMP11", 11, at(6, 0, 0));
    let request = CheckinRequest {
        certificate: device.certificate.to_wire(),
        session_id: 1,
    };

    assert!(matches!(
        deployment
            .gateway
            .check_in(&request, at(22, 0, 0) - chrono::Duration::days(3)),
        Err(CheckinError::OutsideSession { session_id: 1, .. })
    ));
    assert!(deployment.store.list_records(11).unwrap().is_empty());

    let on_day = deployment.gateway.check_in(&request, at(8, 30, 0)).unwrap();
    assert!(on_day.is_created());
    assert_eq!(on_day.record().check_status, CheckStatus::Late);
    assert_eq!(deployment.store.list_records(11).unwrap().len(), 1);
}

#[test]
fn test_expired_certificate_cannot_check_in() {
    let config = Config::from_toml_str("[ca]\nvalidity_secs = 60\n").unwrap();
    let deployment = Deployment::new(&config);
    deployment.add_session(1, TimeSlot::Morning, 8);
    let device = deployment.enroll("EMP08", 8, at(7, 59, 0));

    let request = CheckinRequest {
        certificate: device.certificate.to_wire(),
        session_id: 1,
    };
    assert!(deployment.gateway.check_in(&request, at(8, 0, 0)).is_ok());
    assert!(matches!(
        deployment.gateway.check_in(&request, at(8, 0, 1)),
        Err(CheckinError::Unauthenticated(_))
    ));
}

#[test]
fn test_sealed_checkin_over_handshake_session() {
    let config = Config::from_toml_str("[session]\naead = \"chacha20-poly1305\"\n").unwrap();
    assert_eq!(config.session.aead, AeadAlgorithm::ChaCha20Poly1305);

    let deployment = Deployment::new(&config);
    deployment.add_session(4, TimeSlot::Morning, 9);
    let device = deployment.enroll("EMP09", 9, at(6, 0, 0));
    let gate = deployment.enroll("GATE01", 0, at(6, 0, 0));

    let ca_pub = deployment.ca.ca_public_key();
    let responder = Responder::from_config(
        Credentials::new(gate.certificate, gate.key).unwrap(),
        ca_pub,
        &config.session,
    );
    let (initiator, hello) =
        Initiator::start(Credentials::new(device.certificate, device.key).unwrap(), ca_pub);

    let now = at(8, 1, 0);
    let reply = responder.respond(&hello, now).unwrap();
    let (finish, client) = initiator.finish(&reply, now).unwrap();
    let server = responder.complete(&finish, now).unwrap();
    assert_eq!(server.peer.identity_id, "EMP09");
    assert_eq!(responder.pending_count(), 0);

    let mut cipher = client.cipher(config.session.aead);
    let body = serde_json::to_vec(&SealedCheckin { session_id: 4 }).unwrap();
    let sealed = cipher.encrypt(&body).unwrap();

    // Over the wire and back.
    let sealed: AeadMessage =
        serde_json::from_str(&serde_json::to_string(&sealed).unwrap()).unwrap();

    let outcome = deployment
        .gateway
        .check_in_sealed(&server, config.session.aead, &sealed, now)
        .unwrap();
    assert!(outcome.is_created());
    assert_eq!(outcome.record().employee_id, 9);
    assert_eq!(outcome.record().check_status, CheckStatus::OnTime);

    // The default algorithm cannot open a ChaCha20-Poly1305 message.
    assert!(matches!(
        deployment
            .gateway
            .check_in_sealed(&server, AeadAlgorithm::Aes256Gcm, &sealed, now),
        Err(CheckinError::Sealed(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_checkins_from_one_device() {
    let deployment = Arc::new(Deployment::new(&Config::default_config()));
    deployment.add_session(1, TimeSlot::Morning, 10);
    let device = deployment.enroll("EMP10", 10, at(6, 0, 0));
    let request = Arc::new(CheckinRequest {
        certificate: device.certificate.to_wire(),
        session_id: 1,
    });

    let mut handles = Vec::new();
    for i in 0..12 {
        let deployment = Arc::clone(&deployment);
        let request = Arc::clone(&request);
        handles.push(tokio::task::spawn_blocking(move || {
            deployment.gateway.check_in(&request, at(8, 2, i))
        }));
    }

    let mut created = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap().is_created() {
            created += 1;
        }
    }
    assert_eq!(created, 1);

    let records = deployment.store.list_records(10).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].last_checkin_time, at(8, 2, 11));
}
