//! Timeliness policy.
//!
//! Decides whether a first check-in counts as on time, late or absent by
//! comparing it with the session's scheduled start. Thresholds come from
//! `[checkin]` configuration.

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use rollcall_core::config::CheckinConfig;
use rollcall_core::store::{CheckStatus, Session, TimeSlot};

/// Classifies the first check-in of a day.
pub trait TimelinessPolicy: Send + Sync {
    fn classify(&self, scheduled_start: DateTime<Utc>, first_seen: DateTime<Utc>) -> CheckStatus;
}

/// Fixed thresholds measured from the scheduled start.
///
/// - `lateness <= on_time_grace` → on time (early arrivals included)
/// - `lateness <= absent_after` → late
/// - otherwise → absent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThresholdPolicy {
    on_time_grace: Duration,
    absent_after: Duration,
}

impl ThresholdPolicy {
    pub fn new(on_time_grace: Duration, absent_after: Duration) -> Self {
        Self {
            on_time_grace,
            absent_after,
        }
    }

    pub fn from_config(config: &CheckinConfig) -> Self {
        let minutes = |m: i64| Duration::try_minutes(m).unwrap_or(Duration::MAX);
        Self::new(
            minutes(config.on_time_grace_minutes),
            minutes(config.absent_after_minutes),
        )
    }
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self::from_config(&CheckinConfig::default())
    }
}

impl TimelinessPolicy for ThresholdPolicy {
    fn classify(&self, scheduled_start: DateTime<Utc>, first_seen: DateTime<Utc>) -> CheckStatus {
        let lateness = first_seen - scheduled_start;
        if lateness <= self.on_time_grace {
            CheckStatus::OnTime
        } else if lateness <= self.absent_after {
            CheckStatus::Late
        } else {
            CheckStatus::Absent
        }
    }
}

/// Scheduled start time of each slot (UTC), and how early before it a
/// check-in is admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotSchedule {
    pub morning: NaiveTime,
    pub afternoon: NaiveTime,
    pub evening: NaiveTime,
    pub early_window: Duration,
}

impl SlotSchedule {
    pub fn from_config(config: &CheckinConfig) -> Self {
        Self {
            morning: config.morning_start,
            afternoon: config.afternoon_start,
            evening: config.evening_start,
            early_window: Duration::try_minutes(config.early_window_minutes)
                .unwrap_or(Duration::zero()),
        }
    }

    pub fn slot_start(&self, slot: TimeSlot) -> NaiveTime {
        match slot {
            TimeSlot::Morning => self.morning,
            TimeSlot::Afternoon => self.afternoon,
            TimeSlot::Evening => self.evening,
        }
    }

    pub fn scheduled_start(&self, session: &Session) -> DateTime<Utc> {
        Utc.from_utc_datetime(&session.date.and_time(self.slot_start(session.time_slot)))
    }

    /// True when `event_time` falls on the session's UTC day and no earlier
    /// than `early_window` before its scheduled start.
    pub fn admits(&self, session: &Session, event_time: DateTime<Utc>) -> bool {
        event_time.date_naive() == session.date
            && event_time >= self.scheduled_start(session) - self.early_window
    }
}

impl Default for SlotSchedule {
    fn default() -> Self {
        Self::from_config(&CheckinConfig::default())
    }
}
