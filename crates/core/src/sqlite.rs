//! SQLite-backed store.
//!
//! Implements every store contract over one SQLite database:
//! - `cert`: provisioned identities and their single issued certificate
//! - `sessions`: roster entries (read for scheduled start times)
//! - `checkin_history`: one row per (employee, session, day)
//!
//! # Guarantees
//!
//! - Token consumption is a single conditional `UPDATE … WHERE issued = 0`;
//!   only one caller can observe a changed row.
//! - Check-in transactions run under `BEGIN IMMEDIATE`, taking the write
//!   lock before the lookup so two writers cannot both take the create
//!   branch. A `UNIQUE (employee_id, session_id, checkin_day)` constraint
//!   backs this up.
//! - Durability: WAL journal mode.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::store::{
    CheckStatus, CheckinId, CheckinKey, CheckinRecord, CheckinStore, CheckinTransaction,
    EmployeeId, IdentityStore, NewCheckinRecord, PendingIdentity, Session, SessionDirectory,
    SessionId, TimeSlot,
};
use crate::time::{day_of, format_wire, parse_wire};

const DAY_FORMAT: &str = "%Y-%m-%d";

/// Store over a single SQLite connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create or open a store at the specified path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        info!(path = %path.display(), "Opening attendance store");

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS cert (
                id TEXT PRIMARY KEY,
                token TEXT NOT NULL UNIQUE,
                issued INTEGER NOT NULL DEFAULT 0,
                pub_key BLOB,
                valid_until TEXT,
                employee_id INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                session_id INTEGER PRIMARY KEY,
                date TEXT NOT NULL,
                time_slot TEXT NOT NULL,
                role TEXT NOT NULL,
                employee_id INTEGER
            );

            CREATE TABLE IF NOT EXISTS checkin_history (
                checkin_id INTEGER PRIMARY KEY AUTOINCREMENT,
                employee_id INTEGER NOT NULL,
                session_id INTEGER NOT NULL,
                checkin_day TEXT NOT NULL,
                first_checkin_time TEXT NOT NULL,
                last_checkin_time TEXT NOT NULL,
                check_status TEXT NOT NULL
                    CHECK (check_status IN ('on time', 'late', 'absent')),
                UNIQUE (employee_id, session_id, checkin_day)
            );

            CREATE INDEX IF NOT EXISTS idx_checkin_employee ON checkin_history(employee_id);
            "#,
        )?;

        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Unavailable("sqlite connection lock poisoned".to_string()))
    }
}

/// Map constraint failures to [`Error::Constraint`]; everything else stays a
/// database error.
fn classify(err: rusqlite::Error) -> Error {
    match &err {
        rusqlite::Error::SqliteFailure(code, message)
            if code.code == ErrorCode::ConstraintViolation =>
        {
            Error::Constraint(message.clone().unwrap_or_else(|| err.to_string()))
        }
        _ => Error::Database(err),
    }
}

fn parse_time(column: &str, value: &str) -> Result<DateTime<Utc>> {
    parse_wire(value)
        .ok_or_else(|| Error::Constraint(format!("{} holds malformed timestamp {:?}", column, value)))
}

type RawRecord = (i64, i64, i64, String, String, String);

fn record_from_raw(raw: RawRecord) -> Result<CheckinRecord> {
    let (checkin_id, employee_id, session_id, first, last, status) = raw;
    Ok(CheckinRecord {
        checkin_id,
        employee_id,
        session_id,
        first_checkin_time: parse_time("first_checkin_time", &first)?,
        last_checkin_time: parse_time("last_checkin_time", &last)?,
        check_status: CheckStatus::parse(&status)
            .ok_or_else(|| Error::Constraint(format!("unknown check status {:?}", status)))?,
    })
}

impl IdentityStore for SqliteStore {
    fn get_pending_identity(&self, identity_id: &str) -> Result<Option<PendingIdentity>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                r#"
                SELECT id, token, issued, pub_key, valid_until, employee_id
                FROM cert
                WHERE id = ?1
                "#,
                params![identity_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, Option<Vec<u8>>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()?;

        row.map(
            |(identity_id, one_time_token, issued, public_key, valid_until, employee_id)| {
                Ok(PendingIdentity {
                    identity_id,
                    one_time_token,
                    issued,
                    public_key,
                    valid_until: valid_until
                        .map(|v| parse_time("valid_until", &v))
                        .transpose()?,
                    employee_id,
                })
            },
        )
        .transpose()
    }

    fn mark_issued(
        &self,
        identity_id: &str,
        public_key: &[u8],
        valid_until: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            r#"
            UPDATE cert
            SET issued = 1, pub_key = ?1, valid_until = ?2
            WHERE id = ?3 AND issued = 0
            "#,
            params![public_key, format_wire(&valid_until), identity_id],
        )?;

        if changed == 0 {
            debug!(identity_id = %identity_id, "mark_issued lost compare-and-set");
        }
        Ok(changed == 1)
    }

    fn insert_pending(&self, identity: PendingIdentity) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO cert (id, token, issued, pub_key, valid_until, employee_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                identity.identity_id,
                identity.one_time_token,
                identity.issued,
                identity.public_key,
                identity.valid_until.as_ref().map(format_wire),
                identity.employee_id,
            ],
        )
        .map_err(classify)?;
        Ok(())
    }
}

/// Check-in transaction holding the connection for its whole lifetime.
struct SqliteCheckinTransaction<'a> {
    conn: MutexGuard<'a, Connection>,
    finished: bool,
}

impl CheckinTransaction for SqliteCheckinTransaction<'_> {
    fn find_open_record(&mut self, key: &CheckinKey) -> Result<Option<CheckinRecord>> {
        let raw = self
            .conn
            .query_row(
                r#"
                SELECT checkin_id, employee_id, session_id,
                       first_checkin_time, last_checkin_time, check_status
                FROM checkin_history
                WHERE employee_id = ?1 AND session_id = ?2 AND checkin_day = ?3
                "#,
                params![
                    key.employee_id,
                    key.session_id,
                    key.day.format(DAY_FORMAT).to_string()
                ],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                },
            )
            .optional()?;

        raw.map(record_from_raw).transpose()
    }

    fn create_record(&mut self, record: NewCheckinRecord) -> Result<CheckinRecord> {
        let time = format_wire(&record.time);
        self.conn
            .execute(
                r#"
                INSERT INTO checkin_history (
                    employee_id, session_id, checkin_day,
                    first_checkin_time, last_checkin_time, check_status
                ) VALUES (?1, ?2, ?3, ?4, ?4, ?5)
                "#,
                params![
                    record.employee_id,
                    record.session_id,
                    day_of(&record.time).format(DAY_FORMAT).to_string(),
                    time,
                    record.check_status.as_str(),
                ],
            )
            .map_err(classify)?;

        Ok(CheckinRecord {
            checkin_id: self.conn.last_insert_rowid(),
            employee_id: record.employee_id,
            session_id: record.session_id,
            first_checkin_time: record.time,
            last_checkin_time: record.time,
            check_status: record.check_status,
        })
    }

    fn update_last_seen(&mut self, checkin_id: CheckinId, time: DateTime<Utc>) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE checkin_history SET last_checkin_time = ?1 WHERE checkin_id = ?2",
            params![format_wire(&time), checkin_id],
        )?;
        if changed == 0 {
            return Err(Error::Constraint(format!("check-in {} not found", checkin_id)));
        }
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for SqliteCheckinTransaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.conn.execute_batch("ROLLBACK") {
            warn!(error = %e, "Failed to roll back check-in transaction");
        }
    }
}

impl CheckinStore for SqliteStore {
    fn begin(&self, _key: &CheckinKey) -> Result<Box<dyn CheckinTransaction + '_>> {
        let conn = self.lock()?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Box::new(SqliteCheckinTransaction {
            conn,
            finished: false,
        }))
    }

    fn list_records(&self, employee_id: EmployeeId) -> Result<Vec<CheckinRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT checkin_id, employee_id, session_id,
                   first_checkin_time, last_checkin_time, check_status
            FROM checkin_history
            WHERE employee_id = ?1
            ORDER BY first_checkin_time ASC, checkin_id ASC
            "#,
        )?;

        let raws = stmt
            .query_map(params![employee_id], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })?
            .collect::<std::result::Result<Vec<RawRecord>, _>>()?;

        raws.into_iter().map(record_from_raw).collect()
    }
}

impl SessionDirectory for SqliteStore {
    fn find_session(&self, session_id: SessionId) -> Result<Option<Session>> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                r#"
                SELECT session_id, date, time_slot, role, employee_id
                FROM sessions
                WHERE session_id = ?1
                "#,
                params![session_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                    ))
                },
            )
            .optional()?;

        raw.map(|(session_id, date, time_slot, role, employee_id)| {
            Ok(Session {
                session_id,
                date: NaiveDate::parse_from_str(&date, DAY_FORMAT)
                    .map_err(|_| Error::Constraint(format!("malformed session date {:?}", date)))?,
                time_slot: TimeSlot::parse(&time_slot)
                    .ok_or_else(|| Error::Constraint(format!("unknown time slot {:?}", time_slot)))?,
                role,
                employee_id,
            })
        })
        .transpose()
    }

    fn insert_session(&self, session: Session) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO sessions (session_id, date, time_slot, role, employee_id)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                session.session_id,
                session.date.format(DAY_FORMAT).to_string(),
                session.time_slot.as_str(),
                session.role,
                session.employee_id,
            ],
        )
        .map_err(classify)?;
        Ok(())
    }
}
