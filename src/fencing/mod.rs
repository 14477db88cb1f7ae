//! Ownership fencing against stale ("zombie") writers.
//!
//! Every key-range has a monotonically increasing [`Epoch`]. Taking
//! over a range always succeeds and always bumps the epoch, even if
//! the previous holder is only suspected dead. A holder that was
//! superseded may still be running; the state store checks the
//! token's epoch on every write and rejects anything that isn't
//! current, so the zombie can compute all it wants but never commit.
//!
//! There is no way to revive a stale token. A demoted holder has to
//! [`FencingAuthority::acquire`] again, which gives it a strictly
//! greater epoch and in turn fences whoever held the range before.
//!
//! The epoch counters are meant to live alongside the data they
//! protect; see [`crate::store`] where both stores implement
//! [`FencingAuthority`] themselves. [`in_mem::InMemFencing`] is a
//! standalone version.

use std::collections::HashMap;
use std::fmt::Display;

use serde::Deserialize;
use serde::Serialize;

use crate::errors::StaleWriter;
use crate::errors::StoreError;
use crate::record::Key;

pub mod in_mem;

pub use in_mem::InMemFencing;

/// Ownership generation of a key-range.
///
/// Epoch `0` is never issued; the first [`FencingAuthority::acquire`]
/// on a range returns epoch `1`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Epoch(pub u64);

impl Epoch {
    /// Placeholder epoch for ranges nobody has ever acquired.
    pub const UNOWNED: Epoch = Epoch(0);

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for Epoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Identifies a computation instance that can hold ranges.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HolderId(pub String);

impl From<&str> for HolderId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl Display for HolderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Half-open `[start, end)` range over key bytes.
///
/// An `end` of `None` is unbounded. Ranges are the unit of ownership:
/// a deployment partitions the key space into fixed ranges and a
/// token always names exactly one of them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub start: Vec<u8>,
    pub end: Option<Vec<u8>>,
}

impl KeyRange {
    pub fn new(start: impl Into<Vec<u8>>, end: Option<Vec<u8>>) -> Self {
        Self {
            start: start.into(),
            end,
        }
    }

    /// `[start, end)` from string bounds.
    pub fn between(start: &str, end: &str) -> Self {
        Self::new(start.as_bytes(), Some(end.as_bytes().to_vec()))
    }

    /// The whole key space.
    pub fn full() -> Self {
        Self::new(Vec::new(), None)
    }

    pub fn contains(&self, key: &Key) -> bool {
        let key = key.as_bytes();
        key >= self.start.as_slice() && self.end.as_ref().map_or(true, |end| key < end.as_slice())
    }
}

impl Display for KeyRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let start = String::from_utf8_lossy(&self.start);
        match &self.end {
            Some(end) => write!(f, "[{start:?}, {:?})", String::from_utf8_lossy(end)),
            None => write!(f, "[{start:?}, ..)"),
        }
    }
}

/// The right to write state for keys in a range, valid until a newer
/// token for the same range is issued.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnershipToken {
    pub key_range: KeyRange,
    pub epoch: Epoch,
    pub holder: HolderId,
}

/// Result of [`FencingAuthority::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    Valid,
    /// A different epoch is current for this range.
    Stale { current: Epoch },
}

/// Issues and validates ownership tokens.
///
/// Errors are only ever infrastructure failures of the backing
/// store. Takeover itself is never refused.
pub trait FencingAuthority: Send + Sync {
    /// Take over a range. Returns an epoch strictly greater than any
    /// previously issued for the range.
    fn acquire(&self, range: &KeyRange, candidate: &HolderId) -> Result<OwnershipToken, StoreError>;

    /// The newest epoch issued for a range, if any.
    fn current_epoch(&self, range: &KeyRange) -> Result<Option<Epoch>, StoreError>;

    fn validate(&self, token: &OwnershipToken) -> Result<Validity, StoreError> {
        Ok(match self.current_epoch(&token.key_range)? {
            Some(current) if current == token.epoch => Validity::Valid,
            Some(current) => Validity::Stale { current },
            None => Validity::Stale {
                current: Epoch::UNOWNED,
            },
        })
    }
}

/// Current tokens per range.
///
/// This is the shared bookkeeping behind every in-memory fencing
/// implementation. It is not synchronized itself; callers put it
/// behind the same lock as the data it guards.
#[derive(Debug, Default)]
pub(crate) struct FenceTable(HashMap<KeyRange, OwnershipToken>);

impl FenceTable {
    pub(crate) fn acquire(&mut self, range: &KeyRange, candidate: &HolderId) -> OwnershipToken {
        let epoch = self
            .0
            .get(range)
            .map(|token| token.epoch.next())
            .unwrap_or(Epoch(1));
        let token = OwnershipToken {
            key_range: range.clone(),
            epoch,
            holder: candidate.clone(),
        };
        if let Some(prev) = self.0.insert(range.clone(), token.clone()) {
            tracing::info!(
                "Range {range} taken over by {candidate} at epoch {epoch}; {} at epoch {} is now fenced",
                prev.holder,
                prev.epoch
            );
        } else {
            tracing::info!("Range {range} acquired by {candidate} at epoch {epoch}");
        }
        token
    }

    pub(crate) fn current(&self, range: &KeyRange) -> Option<&OwnershipToken> {
        self.0.get(range)
    }

    /// Reject writes under anything but the current token.
    pub(crate) fn check(&self, token: &OwnershipToken) -> Result<(), StaleWriter> {
        match self.current(&token.key_range) {
            Some(current) if current.epoch == token.epoch && current.holder == token.holder => {
                Ok(())
            }
            current => Err(StaleWriter {
                range: token.key_range.clone(),
                attempted: token.epoch,
                current: current.map(|t| t.epoch).unwrap_or(Epoch::UNOWNED),
            }),
        }
    }
}

#[test]
fn key_range_contains_is_half_open() {
    let range = KeyRange::between("a", "z");
    assert!(range.contains(&Key::from("a")));
    assert!(range.contains(&Key::from("cat")));
    assert!(!range.contains(&Key::from("z")));
    assert!(!range.contains(&Key::from("zebra")));
    assert!(KeyRange::full().contains(&Key::from("zebra")));
    assert!(KeyRange::full().contains(&Key(Vec::new())));
}

#[test]
fn fence_table_epochs_strictly_increase() {
    let mut table = FenceTable::default();
    let range = KeyRange::between("a", "z");

    let t1 = table.acquire(&range, &HolderId::from("node1"));
    let t2 = table.acquire(&range, &HolderId::from("node2"));
    let t3 = table.acquire(&range, &HolderId::from("node1"));

    assert_eq!(t1.epoch, Epoch(1));
    assert_eq!(t2.epoch, Epoch(2));
    assert_eq!(t3.epoch, Epoch(3));
    assert!(table.check(&t3).is_ok());
    assert_eq!(
        table.check(&t1),
        Err(StaleWriter {
            range: range.clone(),
            attempted: Epoch(1),
            current: Epoch(3),
        })
    );
    assert!(table.check(&t2).is_err());
}

#[test]
fn fence_table_rejects_unknown_range() {
    let table = FenceTable::default();
    let token = OwnershipToken {
        key_range: KeyRange::full(),
        epoch: Epoch(1),
        holder: HolderId::from("node1"),
    };
    let err = table.check(&token).unwrap_err();
    assert_eq!(err.current, Epoch::UNOWNED);
}

#[test]
fn token_serde_layout() {
    use serde_test::{assert_tokens, Token};

    let token = OwnershipToken {
        key_range: KeyRange::new(b"a".to_vec(), None),
        epoch: Epoch(7),
        holder: HolderId::from("node1"),
    };
    assert_tokens(
        &token,
        &[
            Token::Struct {
                name: "OwnershipToken",
                len: 3,
            },
            Token::Str("key_range"),
            Token::Struct {
                name: "KeyRange",
                len: 2,
            },
            Token::Str("start"),
            Token::Seq { len: Some(1) },
            Token::U8(b'a'),
            Token::SeqEnd,
            Token::Str("end"),
            Token::None,
            Token::StructEnd,
            Token::Str("epoch"),
            Token::NewtypeStruct { name: "Epoch" },
            Token::U64(7),
            Token::Str("holder"),
            Token::NewtypeStruct { name: "HolderId" },
            Token::Str("node1"),
            Token::StructEnd,
        ],
    );
}
