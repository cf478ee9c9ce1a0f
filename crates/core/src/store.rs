//! Store contracts consumed by the protocol core.
//!
//! The core never owns persistence. Certificate issuance is handed an
//! [`IdentityStore`], the check-in state machine a [`CheckinStore`] and a
//! [`SessionDirectory`]. Two implementations ship with the crate: the
//! mutex-backed [`MemoryStore`] below and the SQLite-backed
//! [`crate::sqlite::SqliteStore`].
//!
//! # Atomicity
//!
//! - [`IdentityStore::mark_issued`] is a compare-and-set: it flips `issued`
//!   from false to true together with the certificate fields, or reports
//!   `false` without writing anything.
//! - [`CheckinStore::begin`] opens a transaction that holds the lock for one
//!   `(employee, session, day)` key across the lookup and the write. Dropping
//!   a transaction without calling [`CheckinTransaction::commit`] rolls it
//!   back, so a cancelled request never leaves a half-applied upsert.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::time::day_of;

pub type EmployeeId = i64;
pub type SessionId = i64;
pub type CheckinId = i64;

/// Out-of-band provisioned identity waiting for its single certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingIdentity {
    pub identity_id: String,
    pub one_time_token: String,
    pub issued: bool,
    /// Uncompressed SEC1 point bound at issuance
    pub public_key: Option<Vec<u8>>,
    pub valid_until: Option<DateTime<Utc>>,
    /// Employee whose attendance this device records
    pub employee_id: EmployeeId,
}

impl PendingIdentity {
    pub fn new(
        identity_id: impl Into<String>,
        one_time_token: impl Into<String>,
        employee_id: EmployeeId,
    ) -> Self {
        Self {
            identity_id: identity_id.into(),
            one_time_token: one_time_token.into(),
            issued: false,
            public_key: None,
            valid_until: None,
            employee_id,
        }
    }
}

/// Timeliness of the first check-in of a day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckStatus {
    #[serde(rename = "on time")]
    OnTime,
    #[serde(rename = "late")]
    Late,
    #[serde(rename = "absent")]
    Absent,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::OnTime => "on time",
            CheckStatus::Late => "late",
            CheckStatus::Absent => "absent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "on time" => Some(CheckStatus::OnTime),
            "late" => Some(CheckStatus::Late),
            "absent" => Some(CheckStatus::Absent),
            _ => None,
        }
    }
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One employee's attendance for one session on one day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckinRecord {
    pub checkin_id: CheckinId,
    pub employee_id: EmployeeId,
    pub session_id: SessionId,
    pub first_checkin_time: DateTime<Utc>,
    pub last_checkin_time: DateTime<Utc>,
    pub check_status: CheckStatus,
}

impl CheckinRecord {
    pub fn key(&self) -> CheckinKey {
        CheckinKey {
            employee_id: self.employee_id,
            session_id: self.session_id,
            day: day_of(&self.first_checkin_time),
        }
    }
}

/// Fields of a record about to be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCheckinRecord {
    pub employee_id: EmployeeId,
    pub session_id: SessionId,
    pub time: DateTime<Utc>,
    pub check_status: CheckStatus,
}

/// Uniqueness key of a [`CheckinRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CheckinKey {
    pub employee_id: EmployeeId,
    pub session_id: SessionId,
    pub day: NaiveDate,
}

impl CheckinKey {
    pub fn for_event(employee_id: EmployeeId, session_id: SessionId, time: &DateTime<Utc>) -> Self {
        Self {
            employee_id,
            session_id,
            day: day_of(time),
        }
    }
}

/// Shift slot of a rostered session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeSlot {
    Morning,
    Afternoon,
    Evening,
}

impl TimeSlot {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeSlot::Morning => "Morning",
            TimeSlot::Afternoon => "Afternoon",
            TimeSlot::Evening => "Evening",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "morning" => Some(TimeSlot::Morning),
            "afternoon" => Some(TimeSlot::Afternoon),
            "evening" => Some(TimeSlot::Evening),
            _ => None,
        }
    }
}

/// Rostered session, produced by the scheduler and read here only to find
/// the scheduled start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub date: NaiveDate,
    pub time_slot: TimeSlot,
    pub role: String,
    pub employee_id: Option<EmployeeId>,
}

/// Identity/token store used by certificate issuance.
pub trait IdentityStore: Send + Sync {
    fn get_pending_identity(&self, identity_id: &str) -> Result<Option<PendingIdentity>>;

    /// Atomically flip `issued` false→true and bind the certificate fields.
    /// Returns `false` when the identity is unknown or already issued.
    fn mark_issued(
        &self,
        identity_id: &str,
        public_key: &[u8],
        valid_until: DateTime<Utc>,
    ) -> Result<bool>;

    /// Provision a new identity. Fails with [`Error::Constraint`] on a
    /// duplicate id or token.
    fn insert_pending(&self, identity: PendingIdentity) -> Result<()>;
}

/// Unit of work over one check-in key.
pub trait CheckinTransaction {
    fn find_open_record(&mut self, key: &CheckinKey) -> Result<Option<CheckinRecord>>;

    fn create_record(&mut self, record: NewCheckinRecord) -> Result<CheckinRecord>;

    fn update_last_seen(&mut self, checkin_id: CheckinId, time: DateTime<Utc>) -> Result<()>;

    fn commit(self: Box<Self>) -> Result<()>;
}

/// Check-in event store used by the check-in state machine.
pub trait CheckinStore: Send + Sync {
    fn begin(&self, key: &CheckinKey) -> Result<Box<dyn CheckinTransaction + '_>>;

    fn list_records(&self, employee_id: EmployeeId) -> Result<Vec<CheckinRecord>>;
}

/// Read access to the session roster.
pub trait SessionDirectory: Send + Sync {
    fn find_session(&self, session_id: SessionId) -> Result<Option<Session>>;

    fn insert_session(&self, session: Session) -> Result<()>;
}

/// Shared handles (`Arc<S>`, `&S`) forward to the store they point at.
macro_rules! forward_store_impls {
    ($($ty:ty),* $(,)?) => {$(
        impl<T: IdentityStore + ?Sized> IdentityStore for $ty {
            fn get_pending_identity(&self, identity_id: &str) -> Result<Option<PendingIdentity>> {
                (**self).get_pending_identity(identity_id)
            }

            fn mark_issued(
                &self,
                identity_id: &str,
                public_key: &[u8],
                valid_until: DateTime<Utc>,
            ) -> Result<bool> {
                (**self).mark_issued(identity_id, public_key, valid_until)
            }

            fn insert_pending(&self, identity: PendingIdentity) -> Result<()> {
                (**self).insert_pending(identity)
            }
        }

        impl<T: CheckinStore + ?Sized> CheckinStore for $ty {
            fn begin(&self, key: &CheckinKey) -> Result<Box<dyn CheckinTransaction + '_>> {
                (**self).begin(key)
            }

            fn list_records(&self, employee_id: EmployeeId) -> Result<Vec<CheckinRecord>> {
                (**self).list_records(employee_id)
            }
        }

        impl<T: SessionDirectory + ?Sized> SessionDirectory for $ty {
            fn find_session(&self, session_id: SessionId) -> Result<Option<Session>> {
                (**self).find_session(session_id)
            }

            fn insert_session(&self, session: Session) -> Result<()> {
                (**self).insert_session(session)
            }
        }
    )*};
}

forward_store_impls!(Arc<T>, &T);

#[derive(Debug, Default)]
struct MemoryState {
    identities: HashMap<String, PendingIdentity>,
    records: BTreeMap<CheckinId, CheckinRecord>,
    sessions: HashMap<SessionId, Session>,
    next_checkin_id: CheckinId,
}

/// In-process store guarded by a single mutex.
///
/// Every operation, including a whole check-in transaction, runs under the
/// lock, which serializes all keys rather than one key at a time.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| Error::Unavailable("memory store lock poisoned".to_string()))
    }
}

impl IdentityStore for MemoryStore {
    fn get_pending_identity(&self, identity_id: &str) -> Result<Option<PendingIdentity>> {
        Ok(self.lock()?.identities.get(identity_id).cloned())
    }

    fn mark_issued(
        &self,
        identity_id: &str,
        public_key: &[u8],
        valid_until: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.lock()?;
        match state.identities.get_mut(identity_id) {
            Some(identity) if !identity.issued => {
                identity.issued = true;
                identity.public_key = Some(public_key.to_vec());
                identity.valid_until = Some(valid_until);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn insert_pending(&self, identity: PendingIdentity) -> Result<()> {
        let mut state = self.lock()?;
        if state.identities.contains_key(&identity.identity_id) {
            return Err(Error::Constraint(format!(
                "identity {} already provisioned",
                identity.identity_id
            )));
        }
        if state
            .identities
            .values()
            .any(|existing| existing.one_time_token == identity.one_time_token)
        {
            return Err(Error::Constraint("one-time token already in use".to_string()));
        }
        state
            .identities
            .insert(identity.identity_id.clone(), identity);
        Ok(())
    }
}

/// Check-in transaction over the locked memory state. Writes are applied in
/// place and undone on drop unless committed.
struct MemoryCheckinTransaction<'a> {
    state: MutexGuard<'a, MemoryState>,
    created: Vec<CheckinId>,
    previous_last_seen: Vec<(CheckinId, DateTime<Utc>)>,
    committed: bool,
}

impl CheckinTransaction for MemoryCheckinTransaction<'_> {
    fn find_open_record(&mut self, key: &CheckinKey) -> Result<Option<CheckinRecord>> {
        Ok(self
            .state
            .records
            .values()
            .find(|record| record.key() == *key)
            .cloned())
    }

    fn create_record(&mut self, record: NewCheckinRecord) -> Result<CheckinRecord> {
        let key = CheckinKey::for_event(record.employee_id, record.session_id, &record.time);
        if self.state.records.values().any(|existing| existing.key() == key) {
            return Err(Error::Constraint(format!(
                "check-in for employee {} session {} on {} already exists",
                key.employee_id, key.session_id, key.day
            )));
        }

        self.state.next_checkin_id += 1;
        let checkin_id = self.state.next_checkin_id;
        let created = CheckinRecord {
            checkin_id,
            employee_id: record.employee_id,
            session_id: record.session_id,
            first_checkin_time: record.time,
            last_checkin_time: record.time,
            check_status: record.check_status,
        };
        self.state.records.insert(checkin_id, created.clone());
        self.created.push(checkin_id);
        Ok(created)
    }

    fn update_last_seen(&mut self, checkin_id: CheckinId, time: DateTime<Utc>) -> Result<()> {
        let record = self
            .state
            .records
            .get_mut(&checkin_id)
            .ok_or_else(|| Error::Constraint(format!("check-in {} not found", checkin_id)))?;
        self.previous_last_seen
            .push((checkin_id, record.last_checkin_time));
        record.last_checkin_time = time;
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.committed = true;
        Ok(())
    }
}

impl Drop for MemoryCheckinTransaction<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for (checkin_id, last_seen) in self.previous_last_seen.drain(..).rev() {
            if let Some(record) = self.state.records.get_mut(&checkin_id) {
                record.last_checkin_time = last_seen;
            }
        }
        for checkin_id in self.created.drain(..) {
            self.state.records.remove(&checkin_id);
        }
    }
}

impl CheckinStore for MemoryStore {
    fn begin(&self, _key: &CheckinKey) -> Result<Box<dyn CheckinTransaction + '_>> {
        Ok(Box::new(MemoryCheckinTransaction {
            state: self.lock()?,
            created: Vec::new(),
            previous_last_seen: Vec::new(),
            committed: false,
        }))
    }

    fn list_records(&self, employee_id: EmployeeId) -> Result<Vec<CheckinRecord>> {
        let mut records: Vec<CheckinRecord> = self
            .lock()?
            .records
            .values()
            .filter(|record| record.employee_id == employee_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| (r.first_checkin_time, r.checkin_id));
        Ok(records)
    }
}

impl SessionDirectory for MemoryStore {
    fn find_session(&self, session_id: SessionId) -> Result<Option<Session>> {
        Ok(self.lock()?.sessions.get(&session_id).cloned())
    }

    fn insert_session(&self, session: Session) -> Result<()> {
        let mut state = self.lock()?;
        if state.sessions.contains_key(&session.session_id) {
            return Err(Error::Constraint(format!(
                "session {} already exists",
                session.session_id
            )));
        }
        state.sessions.insert(session.session_id, session);
        Ok(())
    }
}
