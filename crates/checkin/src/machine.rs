//! Idempotent check-in state machine.
//!
//! One record per (employee, session, UTC day):
//!
//! - first event creates it with `first = last = event_time` and a status
//!   from the [`TimelinessPolicy`]
//! - later events only move `last_checkin_time` forward; `first_checkin_time`
//!   and `check_status` never change
//!
//! The lookup and the write run in one store transaction, so two concurrent
//! first check-ins cannot both create a record, and a failure before commit
//! leaves nothing behind.

use chrono::{DateTime, Utc};
use rollcall_core::config::CheckinConfig;
use rollcall_core::store::{
    CheckinKey, CheckinRecord, CheckinStore, EmployeeId, NewCheckinRecord, SessionDirectory,
    SessionId,
};
use rollcall_core::time::{format_wire, truncate};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{CheckinError, Result};
use crate::policy::{SlotSchedule, ThresholdPolicy, TimelinessPolicy};

/// What `record_event` did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CheckinOutcome {
    /// First event of the day for this employee and session
    Created { record: CheckinRecord },
    /// Record already existed; `advanced` is false when the event was not
    /// later than the stored last check-in (retry or out-of-order delivery)
    Updated { record: CheckinRecord, advanced: bool },
}

impl CheckinOutcome {
    pub fn record(&self) -> &CheckinRecord {
        match self {
            CheckinOutcome::Created { record } | CheckinOutcome::Updated { record, .. } => record,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, CheckinOutcome::Created { .. })
    }
}

pub struct CheckinStateMachine<S, D, P = ThresholdPolicy> {
    store: S,
    sessions: D,
    policy: P,
    schedule: SlotSchedule,
}

impl<S, D> CheckinStateMachine<S, D, ThresholdPolicy>
where
    S: CheckinStore,
    D: SessionDirectory,
{
    /// State machine with the threshold policy and slot times from config.
    pub fn from_config(store: S, sessions: D, config: &CheckinConfig) -> Self {
        Self::new(
            store,
            sessions,
            ThresholdPolicy::from_config(config),
            SlotSchedule::from_config(config),
        )
    }
}

impl<S, D, P> CheckinStateMachine<S, D, P>
where
    S: CheckinStore,
    D: SessionDirectory,
    P: TimelinessPolicy,
{
    pub fn new(store: S, sessions: D, policy: P, schedule: SlotSchedule) -> Self {
        Self {
            store,
            sessions,
            policy,
            schedule,
        }
    }

    /// Record an authenticated check-in event.
    pub fn record_event(
        &self,
        employee_id: EmployeeId,
        session_id: SessionId,
        event_time: DateTime<Utc>,
    ) -> Result<CheckinOutcome> {
        let event_time = truncate(event_time);

        // Resolved before the transaction starts: the directory may share a
        // connection with the check-in store.
        let session = self
            .sessions
            .find_session(session_id)?
            .ok_or(CheckinError::UnknownSession(session_id))?;
        if !self.schedule.admits(&session, event_time) {
            return Err(CheckinError::OutsideSession {
                session_id,
                time: format_wire(&event_time),
            });
        }

        let key = CheckinKey::for_event(employee_id, session_id, &event_time);
        let mut tx = self.store.begin(&key)?;

        match tx.find_open_record(&key)? {
            None => {
                let scheduled = self.schedule.scheduled_start(&session);
                let check_status = self.policy.classify(scheduled, event_time);
                let record = tx.create_record(NewCheckinRecord {
                    employee_id,
                    session_id,
                    time: event_time,
                    check_status,
                })?;
                tx.commit()?;

                info!(
                    employee_id,
                    session_id,
                    checkin_id = record.checkin_id,
                    status = %check_status,
                    time = %format_wire(&event_time),
                    "Check-in recorded"
                );
                Ok(CheckinOutcome::Created { record })
            }
            Some(mut record) => {
                let advanced = event_time > record.last_checkin_time;
                if advanced {
                    tx.update_last_seen(record.checkin_id, event_time)?;
                    record.last_checkin_time = event_time;
                }
                tx.commit()?;

                debug!(
                    employee_id,
                    session_id,
                    checkin_id = record.checkin_id,
                    advanced,
                    "Check-in refreshed"
                );
                Ok(CheckinOutcome::Updated { record, advanced })
            }
        }
    }

    /// All records for an employee, oldest first.
    pub fn history(&self, employee_id: EmployeeId) -> Result<Vec<CheckinRecord>> {
        Ok(self.store.list_records(employee_id)?)
    }
}
