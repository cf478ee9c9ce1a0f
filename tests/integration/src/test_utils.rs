//! Test utilities for end-to-end tests

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rollcall_checkin::{CheckinGateway, CheckinStateMachine};
use rollcall_core::store::{EmployeeId, Session, SessionDirectory, SessionId, TimeSlot};
use rollcall_core::{Config, SqliteStore};
use rollcall_crypto::SigningKeyPair;
use rollcall_identity::{CertificateAuthority, IssueRequest, IssuedCertificate, Provisioner};
use std::path::PathBuf;
use std::sync::Arc;

pub type SharedStore = Arc<SqliteStore>;

pub type Gateway = CheckinGateway<SharedStore, SharedStore, SharedStore>;

/// Fixed instant on the test day (2025-06-03, UTC).
pub fn at(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 3, hour, minute, second)
        .single()
        .unwrap()
}

pub fn test_day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 6, 3).unwrap()
}

/// A CA, store and gateway sharing one temporary SQLite database.
pub struct Deployment {
    pub store: SharedStore,
    pub ca: CertificateAuthority<SharedStore>,
    pub gateway: Gateway,
    db_path: PathBuf,
}

impl Deployment {
    pub fn new(config: &Config) -> Self {
        let db_path = std::env::temp_dir().join(format!("test_rollcall_{}.db", uuid::Uuid::new_v4()));
        let store = Arc::new(SqliteStore::open(&db_path).expect("Failed to open store"));

        let ca = CertificateAuthority::from_config(
            Arc::new(SigningKeyPair::generate()),
            Arc::clone(&store),
            &config.ca,
        )
        .expect("Failed to create CA");

        let machine =
            CheckinStateMachine::from_config(Arc::clone(&store), Arc::clone(&store), &config.checkin);
        let gateway = CheckinGateway::new(Arc::clone(&store), ca.ca_public_key(), machine);

        Self {
            store,
            ca,
            gateway,
            db_path,
        }
    }

    pub fn add_session(&self, session_id: SessionId, time_slot: TimeSlot, employee_id: EmployeeId) {
        self.store
            .insert_session(Session {
                session_id,
                date: test_day(),
                time_slot,
                role: "Floor".to_string(),
                employee_id: Some(employee_id),
            })
            .expect("Failed to add session");
    }

    /// Provision `identity_id` and redeem its token with a fresh device key.
    pub fn enroll(&self, identity_id: &str, employee_id: EmployeeId, now: DateTime<Utc>) -> TestDevice {
        let provisioned = Provisioner::new(Arc::clone(&self.store))
            .provision(identity_id, employee_id, None)
            .expect("Failed to provision");

        let key = Arc::new(SigningKeyPair::generate());
        let request = IssueRequest::new(
            identity_id,
            provisioned.one_time_token,
            key.public_key().as_bytes(),
        )
        .expect("Invalid issue request");
        let certificate = self.ca.issue_at(&request, now).expect("Issuance failed");

        TestDevice { key, certificate }
    }
}

impl Drop for Deployment {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let mut path = self.db_path.clone().into_os_string();
            path.push(suffix);
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Device holding its key and issued certificate.
pub struct TestDevice {
    pub key: Arc<SigningKeyPair>,
    pub certificate: IssuedCertificate,
}
