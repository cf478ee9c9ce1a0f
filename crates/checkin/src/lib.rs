//! Attendance recording for Rollcall.
//!
//! Turns authenticated check-in events into at most one attendance record
//! per employee and session, on the session's UTC day.
//!
//! - [`CheckinGateway`] verifies the device certificate or sealed session message and resolves the employee
//! - [`CheckinStateMachine`] creates or refreshes the record inside one store transaction
//! - [`TimelinessPolicy`] fixes the record's status from the first event

pub mod error;
pub mod gateway;
pub mod machine;
pub mod policy;

pub use error::{CheckinError, Result};
pub use gateway::{CheckinGateway, CheckinRequest, SealedCheckin};
pub use machine::{CheckinOutcome, CheckinStateMachine};
pub use policy::{SlotSchedule, ThresholdPolicy, TimelinessPolicy};
