//! Durable state for keys, the dedup log, and ownership epochs.
//!
//! The store is the only shared mutable resource in the engine. All
//! coordination between nodes goes through it; nodes never lock each
//! other.
//!
//! Each key's entry holds its committed hard state, the cursor into
//! its dedup log, the epoch of the token that last wrote it, and a
//! sequence number bumped by every checkpoint. A [`Checkpoint`]
//! replaces all of those and appends to the dedup log in one atomic
//! write, or does nothing at all. A reader can never observe new
//! state with an old dedup cursor or the other way around.
//!
//! Every write is fenced: the store checks the writer's
//! [`OwnershipToken`] against the current epoch of its range in the
//! same critical section as the write, so a superseded writer is
//! rejected with [`StaleWriter`] no matter how plausible its payload.
//!
//! There are two implementations: [`in_mem::InMemStore`], which
//! supports fault injection for tests, and [`sqlite::SqliteStore`].
//! Both also implement [`crate::fencing::FencingAuthority`] so epochs
//! are stored alongside the data they guard.

use std::fmt::Display;

use chrono::DateTime;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

use crate::errors::CorruptCheckpoint;
use crate::errors::StaleWriter;
use crate::errors::StoreError;
use crate::fencing::Epoch;
use crate::fencing::OwnershipToken;
use crate::record::Key;
use crate::record::Record;
use crate::record::RecordId;

pub mod in_mem;
pub mod sqlite;

pub use in_mem::Fault;
pub use in_mem::InMemStore;
pub use sqlite::SqliteStore;

/// Number of checkpoints committed for a key.
///
/// A key that was never written is at sequence `0`. Commits for a
/// key are totally ordered by this.
#[derive(
    Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Position of the newest entry appended to a key's dedup log.
///
/// Advanced by exactly the number of record IDs a checkpoint appends.
#[derive(
    Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct DedupCursor(pub u64);

impl DedupCursor {
    pub fn advance(&self, by: usize) -> Self {
        Self(self.0 + by as u64)
    }
}

/// Serialized hard state of a key.
///
/// The store only deals in bytes so each user function can keep
/// whatever state type it likes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateBytes(pub Vec<u8>);

impl StateBytes {
    /// Serialize user state into bytes the store can keep.
    pub fn ser<T: Serialize>(obj: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_vec(obj).map(Self)
    }

    /// Deserialize bytes from the store back into user state.
    pub fn de<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.0)
    }

    pub(crate) fn checksum(state: Option<&StateBytes>) -> u64 {
        state.map_or(0, |bytes| seahash::hash(&bytes.0))
    }
}

/// An entry in a key's durable dedup log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupEntry {
    pub record_id: RecordId,
    pub key: Key,
    pub committed_at: DateTime<Utc>,
    pub position: DedupCursor,
}

/// Everything the store persists for a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredKey {
    pub key: Key,
    /// `None` if the user function discarded the key's state.
    pub hard_state: Option<StateBytes>,
    /// Checksum of `hard_state` at the time it was written.
    pub checksum: u64,
    pub dedup_cursor: DedupCursor,
    pub token_epoch: Epoch,
    pub sequence_number: SequenceNumber,
    /// Downstream records produced by the last commit. Re-sent when a
    /// worker for the key starts up.
    pub productions: Vec<Record>,
    pub committed_at: DateTime<Utc>,
}

impl StoredKey {
    /// Check the hard state still matches what was written.
    pub fn verify(&self) -> Result<(), CorruptCheckpoint> {
        let found = StateBytes::checksum(self.hard_state.as_ref());
        if found != self.checksum {
            return Err(CorruptCheckpoint {
                key: self.key.clone(),
                seq: self.sequence_number,
                detail: format!(
                    "hard state checksum {found:#018x} does not match recorded {:#018x}",
                    self.checksum
                ),
            });
        }
        Ok(())
    }
}

/// A single atomic write of a key's state and dedup log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub key: Key,
    pub hard_state: Option<StateBytes>,
    /// Record IDs committed by this checkpoint, in processing order.
    pub dedup_append: Vec<RecordId>,
    /// Drop dedup entries committed before this time.
    pub purge_before: Option<DateTime<Utc>>,
    pub productions: Vec<Record>,
    pub token: OwnershipToken,
    /// The sequence number this checkpoint was computed on top of.
    /// The write only succeeds if the stored key is still there.
    pub expected_seq: SequenceNumber,
    pub committed_at: DateTime<Utc>,
}

/// A successful [`StateStore::checkpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Committed {
    pub seq: SequenceNumber,
    pub dedup_cursor: DedupCursor,
    /// Dedup entries removed by `purge_before`.
    pub purged: usize,
}

/// Explicit acknowledgment that falling back to an older checkpoint
/// loses every effect committed after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLossAck {
    pub operator: String,
    pub reason: String,
}

/// Durable key-value store with fenced, atomic checkpoints.
pub trait StateStore: Send + Sync {
    /// Read a key's committed entry.
    ///
    /// Returns [`StoreError::Corrupt`] if the entry fails
    /// verification.
    fn load(&self, key: &Key) -> Result<Option<StoredKey>, StoreError>;

    /// Atomically commit a checkpoint.
    ///
    /// Rejected with [`StoreError::StaleWriter`] if the token is not
    /// current for its range, or older than the epoch that last wrote
    /// the key; rejected with [`StoreError::SequenceConflict`] if the
    /// key moved past `expected_seq`. Rejected writes have no effect.
    fn checkpoint(&self, ckpt: &Checkpoint) -> Result<Committed, StoreError>;

    /// Whether the durable dedup log of a key has a record ID.
    fn dedup_contains(&self, key: &Key, record_id: &RecordId) -> Result<bool, StoreError>;

    /// All retained dedup log entries of a key, oldest first.
    fn dedup_scan(&self, key: &Key) -> Result<Vec<DedupEntry>, StoreError>;

    /// Sequence numbers of retained older checkpoints of a key,
    /// newest first. Does not include the current one.
    fn history(&self, key: &Key) -> Result<Vec<SequenceNumber>, StoreError>;

    /// Replace a key's current entry with the newest intact older
    /// checkpoint, committed as a new sequence number.
    ///
    /// Dedup entries the restored checkpoint had not yet appended are
    /// dropped so the records they name can be processed again.
    fn fallback(
        &self,
        key: &Key,
        token: &OwnershipToken,
        ack: &DataLossAck,
    ) -> Result<StoredKey, StoreError>;
}

/// Checks shared by every store before applying a checkpoint, once
/// the range's token has been validated.
///
/// `stored` is the key's current entry, if any.
pub(crate) fn check_checkpoint(
    ckpt: &Checkpoint,
    stored: Option<(&Epoch, &SequenceNumber)>,
) -> Result<(), StoreError> {
    if !ckpt.token.key_range.contains(&ckpt.key) {
        return Err(StoreError::Backend(format!(
            "key {} is outside of token range {}",
            ckpt.key, ckpt.token.key_range
        )));
    }
    let (stored_epoch, stored_seq) = stored
        .map(|(epoch, seq)| (*epoch, *seq))
        .unwrap_or((Epoch::UNOWNED, SequenceNumber::default()));
    // Range bounds can move between deployments; the epoch on the key
    // itself still fences writers from before the move.
    if stored_epoch > ckpt.token.epoch {
        return Err(StaleWriter {
            range: ckpt.token.key_range.clone(),
            attempted: ckpt.token.epoch,
            current: stored_epoch,
        }
        .into());
    }
    if stored_seq != ckpt.expected_seq {
        return Err(StoreError::SequenceConflict {
            key: ckpt.key.clone(),
            expected: ckpt.expected_seq,
            found: stored_seq,
        });
    }
    Ok(())
}

/// Run a store call on the blocking thread pool.
///
/// Store implementations are synchronous and may do file IO under a
/// lock; async callers go through here.
pub(crate) async fn blocking<T, F>(op: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|err| StoreError::Backend(format!("store task failed: {err}")))?
}

/// Log a fallback so there is a trail of who accepted the data loss.
pub(crate) fn log_fallback(key: &Key, from: SequenceNumber, to: &StoredKey, ack: &DataLossAck) {
    tracing::error!(
        "Key {key} fell back from checkpoint {from} to the state of checkpoint with cursor {:?}; \
         data loss acknowledged by {}: {}",
        to.dedup_cursor,
        ack.operator,
        ack.reason
    );
}

#[test]
fn state_bytes_roundtrip_and_checksum() {
    let bytes = StateBytes::ser(&vec![1u32, 2, 3]).unwrap();
    let back: Vec<u32> = bytes.de().unwrap();
    assert_eq!(back, vec![1, 2, 3]);
    assert_ne!(StateBytes::checksum(Some(&bytes)), 0);
    assert_eq!(StateBytes::checksum(None), 0);
}

#[test]
fn verify_detects_bit_rot() {
    let hard_state = StateBytes::ser(&"hello").unwrap();
    let mut stored = StoredKey {
        key: Key::from("x"),
        checksum: StateBytes::checksum(Some(&hard_state)),
        hard_state: Some(hard_state),
        dedup_cursor: DedupCursor(1),
        token_epoch: Epoch(1),
        sequence_number: SequenceNumber(1),
        productions: Vec::new(),
        committed_at: Utc::now(),
    };
    assert!(stored.verify().is_ok());

    if let Some(state) = stored.hard_state.as_mut() {
        state.0[1] ^= 0xff;
    }
    let err = stored.verify().unwrap_err();
    assert_eq!(err.seq, SequenceNumber(1));
}
