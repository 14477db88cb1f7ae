//! The unit of work flowing through the engine.
//!
//! A [`Record`] is immutable once produced. Its [`RecordId`] is the
//! identity the whole exactly-once machinery keys off of: the
//! delivery tracker retries by it, the dedup filter remembers it, and
//! downstream records derive their own IDs from it.

use std::fmt::Display;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

/// Globally unique ID of a record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(pub Uuid);

impl RecordId {
    /// Random ID for a record created by a producer at the edge of
    /// the pipeline.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// ID of the `index`th record emitted while processing `self`.
    ///
    /// This is a pure function of its inputs so that reprocessing a
    /// redelivered record emits downstream records with the same IDs
    /// as the first attempt, which the downstream dedup filter then
    /// recognizes.
    pub fn derive(&self, index: usize) -> Self {
        Self(Uuid::new_v5(&self.0, &(index as u64).to_be_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Routing key of a record.
///
/// All state is partitioned by key and all per-key work is
/// serialized.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(pub Vec<u8>);

impl Key {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for Key {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

/// Opaque record contents. Only the user function interprets these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload(pub Vec<u8>);

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// Immutable unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    id: RecordId,
    key: Key,
    payload: Payload,
    produced_at: DateTime<Utc>,
}

impl Record {
    /// Create a new record with a fresh random ID, produced now.
    pub fn new(key: impl Into<Key>, payload: impl Into<Payload>) -> Self {
        Self::with_id(RecordId::random(), key, payload, Utc::now())
    }

    pub fn with_id(
        id: RecordId,
        key: impl Into<Key>,
        payload: impl Into<Payload>,
        produced_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            key: key.into(),
            payload: payload.into(),
            produced_at,
        }
    }

    pub fn id(&self) -> RecordId {
        self.id
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn produced_at(&self) -> DateTime<Utc> {
        self.produced_at
    }
}

#[test]
fn derived_ids_are_deterministic() {
    let parent = RecordId::random();
    assert_eq!(parent.derive(0), parent.derive(0));
    assert_ne!(parent.derive(0), parent.derive(1));
    assert_ne!(parent.derive(0), RecordId::random().derive(0));
}

#[test]
fn key_display_is_lossy_utf8() {
    assert_eq!(Key::from("cat").to_string(), "cat");
    assert_eq!(Key(vec![0xff, b'a']).to_string(), "\u{fffd}a");
}
