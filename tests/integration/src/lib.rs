//! End-to-end tests for Rollcall
//!
//! This test suite validates:
//! - Provisioning and one-time certificate issuance against the SQLite store
//! - Certificate-authenticated check-ins, plain and over a handshake session
//! - Check-in idempotency and timeliness across a working day

pub mod test_utils;

#[cfg(test)]
mod enrollment_tests;

#[cfg(test)]
mod attendance_tests;
