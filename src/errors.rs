//! Error taxonomy of the engine.
//!
//! Errors are grouped by how they propagate:
//!
//! - [`StoreError::Transient`] is retried with backoff by the
//!   checkpoint coordinator and never surfaces past the computation
//!   node.
//!
//! - [`StaleWriter`] and [`CorruptCheckpoint`] are surfaced to the
//!   node's supervisor, which decides whether to reacquire, migrate,
//!   or halt.
//!
//! - [`DeliveryExhausted`] is surfaced to the original producer as a
//!   terminal failure for that record.

use std::panic::Location;

use chrono::DateTime;
use chrono::Utc;
use thiserror::Error;

use crate::fencing::Epoch;
use crate::fencing::KeyRange;
use crate::record::Key;
use crate::record::RecordId;
use crate::store::SequenceNumber;

/// A write carried a token whose epoch is no longer current for its
/// range. The write was not applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("stale writer for range {range}: token epoch {attempted}, current epoch {current}")]
pub struct StaleWriter {
    pub range: KeyRange,
    pub attempted: Epoch,
    pub current: Epoch,
}

/// A persisted checkpoint failed verification on read.
///
/// Fatal for the key. Requires an operator to intervene, or an
/// explicit [`crate::store::DataLossAck`] to fall back to an older
/// checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("corrupt checkpoint for key {key} at sequence {seq}: {detail}")]
pub struct CorruptCheckpoint {
    pub key: Key,
    pub seq: SequenceNumber,
    pub detail: String,
}

/// Errors from a state store backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Backend temporarily unavailable. Nothing was written.
    #[error("state store unavailable: {0}")]
    Transient(String),
    #[error(transparent)]
    StaleWriter(#[from] StaleWriter),
    /// The checkpoint was written against an older sequence number
    /// than the one stored. Someone else committed this key under a
    /// token we thought was ours.
    #[error("sequence conflict on key {key}: expected {expected}, found {found}")]
    SequenceConflict {
        key: Key,
        expected: SequenceNumber,
        found: SequenceNumber,
    },
    #[error(transparent)]
    Corrupt(#[from] CorruptCheckpoint),
    /// Anything else the backend reports. Not retried.
    #[error("state store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match err.sqlite_error_code() {
            Some(
                ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::SystemIoFailure
                | ErrorCode::CannotOpen
                | ErrorCode::DiskFull,
            ) => Self::Transient(err.to_string()),
            _ => Self::Backend(err.to_string()),
        }
    }
}

impl From<rusqlite_migration::Error> for StoreError {
    fn from(err: rusqlite_migration::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

/// A record could not be delivered within its retry budget.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("delivery of record {record_id} for key {key} exhausted after {attempts} attempts (first sent {first_sent_at})")]
pub struct DeliveryExhausted {
    pub record_id: RecordId,
    pub key: Key,
    pub attempts: u32,
    pub first_sent_at: DateTime<Utc>,
}

/// The sender has too many unacknowledged records outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("backpressure: {outstanding} records outstanding, budget is {limit}")]
pub struct Backpressure {
    pub outstanding: usize,
    pub limit: usize,
}

/// The user function rejected a record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("user function failed: {0}")]
pub struct LogicError(pub String);

/// Configuration could not be loaded or is invalid.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    Env {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("error parsing configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("error reading configuration: {0}")]
    Io(#[from] std::io::Error),
}

/// Top level error of engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Logic(#[from] LogicError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("error encoding state: {0}")]
    Encoding(#[from] serde_json::Error),
    /// The node no longer owns the range this key belongs to.
    #[error("no valid ownership token for key {0}")]
    NotOwned(Key),
    #[error("engine is shutting down")]
    Shutdown,
    #[error("{0}")]
    Internal(String),
}

/// Use this function to create an internal error with location
/// tracking.
#[track_caller]
pub(crate) fn tracked_err(msg: &str) -> EngineError {
    let caller = Location::caller();
    EngineError::Internal(prepend_caller(caller, msg))
}

/// Prepend '({caller}) ' to the message
fn prepend_caller(caller: &Location, msg: &str) -> String {
    format!("({caller}) {msg}")
}

#[test]
fn tracked_err_includes_location() {
    let err = tracked_err("key worker vanished");
    let msg = err.to_string();
    assert!(msg.contains("errors.rs"), "{msg}");
    assert!(msg.ends_with("key worker vanished"), "{msg}");
}

#[test]
fn only_unavailable_is_transient() {
    assert!(StoreError::Transient("busy".into()).is_transient());
    assert!(!StoreError::Backend("constraint".into()).is_transient());
    assert!(!StoreError::StaleWriter(StaleWriter {
        range: KeyRange::full(),
        attempted: Epoch(1),
        current: Epoch(2),
    })
    .is_transient());
}
