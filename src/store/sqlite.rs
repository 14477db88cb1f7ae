//! SQLite implementation of the state store.
//!
//! One database holds four tables:
//!
//! - `fences`: current epoch and holder per key-range.
//! - `keys`: the current checkpoint of each key.
//! - `checkpoint_history`: a few older checkpoints per key, for
//!   fallback after corruption.
//! - `dedup_log`: committed record IDs per key, by log position.
//!
//! Every checkpoint runs as a single `IMMEDIATE` transaction that
//! first re-reads the range's epoch, so fencing and the write are
//! atomic even with multiple processes sharing the file.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::sync::MutexGuard;

use chrono::TimeZone;
use chrono::Utc;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::Row;
use rusqlite::Transaction;
use rusqlite::TransactionBehavior;
use rusqlite_migration::Migrations;
use rusqlite_migration::M;
use uuid::Uuid;

use super::*;
use crate::fencing::FencingAuthority;
use crate::fencing::HolderId;
use crate::fencing::KeyRange;

fn get_migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(
            "CREATE TABLE fences ( \
             range TEXT NOT NULL PRIMARY KEY, \
             epoch INTEGER NOT NULL CHECK (epoch > 0), \
             holder TEXT NOT NULL, \
             acquired_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP \
             ) STRICT",
        ),
        M::up(
            "CREATE TABLE keys ( \
             key BLOB NOT NULL PRIMARY KEY, \
             seq INTEGER NOT NULL CHECK (seq > 0), \
             token_epoch INTEGER NOT NULL, \
             dedup_cursor INTEGER NOT NULL CHECK (dedup_cursor >= 0), \
             hard_state BLOB, \
             checksum INTEGER NOT NULL, \
             productions TEXT NOT NULL, \
             committed_at INTEGER NOT NULL \
             ) STRICT",
        ),
        M::up(
            "CREATE TABLE checkpoint_history ( \
             key BLOB NOT NULL, \
             seq INTEGER NOT NULL, \
             token_epoch INTEGER NOT NULL, \
             dedup_cursor INTEGER NOT NULL, \
             hard_state BLOB, \
             checksum INTEGER NOT NULL, \
             productions TEXT NOT NULL, \
             committed_at INTEGER NOT NULL, \
             PRIMARY KEY (key, seq) \
             ) STRICT",
        ),
        M::up(
            "CREATE TABLE dedup_log ( \
             key BLOB NOT NULL, \
             position INTEGER NOT NULL CHECK (position > 0), \
             record_id BLOB NOT NULL, \
             committed_at INTEGER NOT NULL, \
             PRIMARY KEY (key, position) \
             ) STRICT",
        ),
        M::up("CREATE INDEX dedup_log_by_id ON dedup_log (key, record_id)"),
    ])
}

#[test]
fn migrations_valid() -> rusqlite_migration::Result<()> {
    get_migrations().validate()
}

/// Columns of `keys` and `checkpoint_history`, in row-mapping order.
const CHECKPOINT_COLUMNS: &str =
    "key, seq, token_epoch, dedup_cursor, hard_state, checksum, productions, committed_at";

fn to_int(value: u64, what: &str) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Backend(format!("{what} {value} can't fit into SQLite int")))
}

fn range_id(range: &KeyRange) -> Result<String, StoreError> {
    serde_json::to_string(range).map_err(|err| StoreError::Backend(err.to_string()))
}

/// A checkpoint row as SQLite hands it to us, before any decoding
/// that could turn out to be corruption.
struct RawCheckpoint {
    key: Vec<u8>,
    seq: i64,
    token_epoch: i64,
    dedup_cursor: i64,
    hard_state: Option<Vec<u8>>,
    checksum: i64,
    productions: String,
    committed_at: i64,
}

impl RawCheckpoint {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            key: row.get(0)?,
            seq: row.get(1)?,
            token_epoch: row.get(2)?,
            dedup_cursor: row.get(3)?,
            hard_state: row.get(4)?,
            checksum: row.get(5)?,
            productions: row.get(6)?,
            committed_at: row.get(7)?,
        })
    }

    fn decode(self) -> Result<StoredKey, StoreError> {
        let key = Key(self.key);
        let seq = SequenceNumber(self.seq.max(0) as u64);
        let corrupt = |detail: String| CorruptCheckpoint {
            key: key.clone(),
            seq,
            detail,
        };
        let productions: Vec<Record> = serde_json::from_str(&self.productions)
            .map_err(|err| corrupt(format!("unreadable productions: {err}")))?;
        let committed_at = Utc
            .timestamp_millis_opt(self.committed_at)
            .single()
            .ok_or_else(|| corrupt(format!("bad commit time {}", self.committed_at)))?;
        if self.dedup_cursor < 0 || self.token_epoch < 0 {
            return Err(corrupt("negative cursor or epoch".into()).into());
        }

        let stored = StoredKey {
            key: key.clone(),
            hard_state: self.hard_state.map(StateBytes),
            // Stored as the same 64 bits, reinterpreted.
            checksum: self.checksum as u64,
            dedup_cursor: DedupCursor(self.dedup_cursor as u64),
            token_epoch: Epoch(self.token_epoch as u64),
            sequence_number: seq,
            productions,
            committed_at,
        };
        stored.verify()?;
        Ok(stored)
    }
}

/// A state store backed by a SQLite database file.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    history_len: usize,
    tear_next: AtomicBool,
}

impl SqliteStore {
    /// Open (creating if needed) a store at a path.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        tracing::debug!("Opening SQLite state store at {path:?}");
        Self::setup(Connection::open(path)?)
    }

    /// A private, non-durable store. Mostly for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::setup(Connection::open_in_memory()?)
    }

    /// Setup our connection-level pragmas and bring the schema up to
    /// date.
    fn setup(mut conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        // These are recommended by Litestream.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", "5000")?;
        tracing::debug!("Running any pending SQLite migrations");
        get_migrations().to_latest(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            history_len: 2,
            tear_next: AtomicBool::new(false),
        })
    }

    /// Keep up to `history_len` older checkpoints per key.
    pub fn with_history(mut self, history_len: usize) -> Self {
        self.history_len = history_len;
        self
    }

    /// Abort the next checkpoint halfway through its transaction,
    /// after the key row was written but before the dedup log was.
    pub fn tear_next_checkpoint(&self) {
        self.tear_next.store(true, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current_fence(txn: &Transaction, range: &KeyRange) -> Result<Option<(Epoch, HolderId)>, StoreError> {
        Ok(txn
            .query_row(
                "SELECT epoch, holder FROM fences WHERE range = ?1",
                [range_id(range)?],
                |row| Ok((Epoch(row.get::<_, i64>(0)? as u64), HolderId(row.get(1)?))),
            )
            .optional()?)
    }

    fn check_fence(txn: &Transaction, token: &OwnershipToken) -> Result<(), StoreError> {
        match Self::current_fence(txn, &token.key_range)? {
            Some((epoch, holder)) if epoch == token.epoch && holder == token.holder => Ok(()),
            current => Err(StaleWriter {
                range: token.key_range.clone(),
                attempted: token.epoch,
                current: current.map(|(epoch, _)| epoch).unwrap_or(Epoch::UNOWNED),
            }
            .into()),
        }
    }

    fn write_current(txn: &Transaction, stored: &StoredKey) -> Result<(), StoreError> {
        let productions = serde_json::to_string(&stored.productions)
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        txn.execute(
            "INSERT INTO keys \
             (key, seq, token_epoch, dedup_cursor, hard_state, checksum, productions, committed_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT (key) DO UPDATE \
             SET seq = EXCLUDED.seq, \
             token_epoch = EXCLUDED.token_epoch, \
             dedup_cursor = EXCLUDED.dedup_cursor, \
             hard_state = EXCLUDED.hard_state, \
             checksum = EXCLUDED.checksum, \
             productions = EXCLUDED.productions, \
             committed_at = EXCLUDED.committed_at",
            (
                &stored.key.0,
                to_int(stored.sequence_number.0, "sequence number")?,
                to_int(stored.token_epoch.0, "epoch")?,
                to_int(stored.dedup_cursor.0, "dedup cursor")?,
                stored.hard_state.as_ref().map(|s| &s.0),
                stored.checksum as i64,
                productions,
                stored.committed_at.timestamp_millis(),
            ),
        )?;
        Ok(())
    }
}

impl FencingAuthority for SqliteStore {
    fn acquire(&self, range: &KeyRange, candidate: &HolderId) -> Result<OwnershipToken, StoreError> {
        let mut conn = self.lock();
        let txn = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let prev = Self::current_fence(&txn, range)?;
        let epoch = prev
            .as_ref()
            .map(|(epoch, _)| epoch.next())
            .unwrap_or(Epoch(1));
        txn.execute(
            "INSERT INTO fences (range, epoch, holder) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT (range) DO UPDATE \
             SET epoch = EXCLUDED.epoch, holder = EXCLUDED.holder, \
             acquired_at = CURRENT_TIMESTAMP",
            (range_id(range)?, to_int(epoch.0, "epoch")?, &candidate.0),
        )?;
        txn.commit()?;

        match prev {
            Some((prev_epoch, prev_holder)) => tracing::info!(
                "Range {range} taken over by {candidate} at epoch {epoch}; \
                 {prev_holder} at epoch {prev_epoch} is now fenced"
            ),
            None => tracing::info!("Range {range} acquired by {candidate} at epoch {epoch}"),
        }
        Ok(OwnershipToken {
            key_range: range.clone(),
            epoch,
            holder: candidate.clone(),
        })
    }

    fn current_epoch(&self, range: &KeyRange) -> Result<Option<Epoch>, StoreError> {
        let mut conn = self.lock();
        let txn = conn.transaction()?;
        let current = Self::current_fence(&txn, range)?;
        Ok(current.map(|(epoch, _)| epoch))
    }
}

impl StateStore for SqliteStore {
    fn load(&self, key: &Key) -> Result<Option<StoredKey>, StoreError> {
        let conn = self.lock();
        let raw = conn
            .query_row(
                &format!("SELECT {CHECKPOINT_COLUMNS} FROM keys WHERE key = ?1"),
                [&key.0],
                RawCheckpoint::from_row,
            )
            .optional()?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let stored = raw.decode()?;

        // The log can never run ahead of the cursor that was
        // committed with it.
        let max_position: Option<i64> = conn.query_row(
            "SELECT MAX(position) FROM dedup_log WHERE key = ?1",
            [&key.0],
            |row| row.get(0),
        )?;
        if let Some(max_position) = max_position {
            if max_position as u64 > stored.dedup_cursor.0 {
                return Err(CorruptCheckpoint {
                    key: key.clone(),
                    seq: stored.sequence_number,
                    detail: format!(
                        "dedup log position {max_position} is past cursor {}",
                        stored.dedup_cursor.0
                    ),
                }
                .into());
            }
        }
        Ok(Some(stored))
    }

    #[tracing::instrument(name = "sqlite_checkpoint", skip_all, fields(key = %ckpt.key))]
    fn checkpoint(&self, ckpt: &Checkpoint) -> Result<Committed, StoreError> {
        let mut conn = self.lock();
        let txn = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        Self::check_fence(&txn, &ckpt.token)?;
        let existing: Option<(i64, i64, i64)> = txn
            .query_row(
                "SELECT token_epoch, seq, dedup_cursor FROM keys WHERE key = ?1",
                [&ckpt.key.0],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let existing = existing.map(|(epoch, seq, cursor)| {
            (
                Epoch(epoch as u64),
                SequenceNumber(seq as u64),
                DedupCursor(cursor as u64),
            )
        });
        check_checkpoint(ckpt, existing.as_ref().map(|(e, s, _)| (e, s)))?;

        if existing.is_some() {
            txn.execute(
                &format!(
                    "INSERT INTO checkpoint_history ({CHECKPOINT_COLUMNS}) \
                     SELECT {CHECKPOINT_COLUMNS} FROM keys WHERE key = ?1"
                ),
                [&ckpt.key.0],
            )?;
        }

        let prev_cursor = existing.map(|(_, _, cursor)| cursor).unwrap_or_default();
        let next = StoredKey {
            key: ckpt.key.clone(),
            checksum: StateBytes::checksum(ckpt.hard_state.as_ref()),
            hard_state: ckpt.hard_state.clone(),
            dedup_cursor: prev_cursor.advance(ckpt.dedup_append.len()),
            token_epoch: ckpt.token.epoch,
            sequence_number: ckpt.expected_seq.next(),
            productions: ckpt.productions.clone(),
            committed_at: ckpt.committed_at,
        };
        Self::write_current(&txn, &next)?;

        if self.tear_next.swap(false, Ordering::SeqCst) {
            // Dropping the transaction rolls it back.
            tracing::debug!("Tearing checkpoint {} for key {}", next.sequence_number, next.key);
            return Err(StoreError::Transient("injected torn write".into()));
        }

        for (i, record_id) in ckpt.dedup_append.iter().enumerate() {
            txn.execute(
                "INSERT INTO dedup_log (key, position, record_id, committed_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                (
                    &ckpt.key.0,
                    to_int(prev_cursor.advance(i + 1).0, "dedup position")?,
                    record_id.as_bytes().as_slice(),
                    ckpt.committed_at.timestamp_millis(),
                ),
            )?;
        }

        let purged = match ckpt.purge_before {
            Some(before) => txn.execute(
                "DELETE FROM dedup_log WHERE key = ?1 AND committed_at < ?2",
                (&ckpt.key.0, before.timestamp_millis()),
            )?,
            None => 0,
        };

        txn.execute(
            "DELETE FROM checkpoint_history \
             WHERE key = ?1 AND seq NOT IN ( \
             SELECT seq FROM checkpoint_history WHERE key = ?1 \
             ORDER BY seq DESC LIMIT ?2 \
             )",
            (&ckpt.key.0, self.history_len as i64),
        )?;

        txn.commit()?;
        tracing::trace!(
            "Committed key {} at {} under epoch {}",
            ckpt.key,
            next.sequence_number,
            ckpt.token.epoch
        );
        Ok(Committed {
            seq: next.sequence_number,
            dedup_cursor: next.dedup_cursor,
            purged,
        })
    }

    fn dedup_contains(&self, key: &Key, record_id: &RecordId) -> Result<bool, StoreError> {
        Ok(self.lock().query_row(
            "SELECT EXISTS ( \
             SELECT 1 FROM dedup_log WHERE key = ?1 AND record_id = ?2 \
             )",
            (&key.0, record_id.as_bytes().as_slice()),
            |row| row.get(0),
        )?)
    }

    fn dedup_scan(&self, key: &Key) -> Result<Vec<DedupEntry>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT position, record_id, committed_at FROM dedup_log \
             WHERE key = ?1 ORDER BY position ASC",
        )?;
        let rows = stmt
            .query_map([&key.0], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(position, record_id, committed_at)| -> Result<DedupEntry, StoreError> {
                let record_id = Uuid::from_slice(&record_id)
                    .map_err(|err| StoreError::Backend(format!("bad record id in dedup log: {err}")))?;
                let committed_at = Utc
                    .timestamp_millis_opt(committed_at)
                    .single()
                    .ok_or_else(|| StoreError::Backend(format!("bad commit time {committed_at}")))?;
                Ok(DedupEntry {
                    record_id: RecordId(record_id),
                    key: key.clone(),
                    committed_at,
                    position: DedupCursor(position as u64),
                })
            })
            .collect()
    }

    fn history(&self, key: &Key) -> Result<Vec<SequenceNumber>, StoreError> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT seq FROM checkpoint_history WHERE key = ?1 ORDER BY seq DESC")?;
        let seqs = stmt
            .query_map([&key.0], |row| row.get::<_, i64>(0))?
            .map(|seq| seq.map(|seq| SequenceNumber(seq as u64)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(seqs)
    }

    fn fallback(
        &self,
        key: &Key,
        token: &OwnershipToken,
        ack: &DataLossAck,
    ) -> Result<StoredKey, StoreError> {
        let mut conn = self.lock();
        let txn = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        Self::check_fence(&txn, token)?;
        if !token.key_range.contains(key) {
            return Err(StoreError::Backend(format!(
                "key {key} is outside of token range {}",
                token.key_range
            )));
        }

        let from: i64 = txn
            .query_row("SELECT seq FROM keys WHERE key = ?1", [&key.0], |row| row.get(0))
            .optional()?
            .ok_or_else(|| StoreError::Backend(format!("no checkpoint for key {key}")))?;
        let from = SequenceNumber(from as u64);

        let restored = {
            let mut stmt = txn.prepare(&format!(
                "SELECT {CHECKPOINT_COLUMNS} FROM checkpoint_history \
                 WHERE key = ?1 ORDER BY seq DESC"
            ))?;
            let raws = stmt
                .query_map([&key.0], RawCheckpoint::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            raws.into_iter()
                .find_map(|raw| raw.decode().ok())
                .ok_or_else(|| {
                    StoreError::Backend(format!("no intact older checkpoint for key {key}"))
                })?
        };

        let next = StoredKey {
            token_epoch: token.epoch,
            sequence_number: from.next(),
            committed_at: Utc::now(),
            ..restored
        };
        Self::write_current(&txn, &next)?;
        txn.execute(
            "DELETE FROM dedup_log WHERE key = ?1 AND position > ?2",
            (&key.0, to_int(next.dedup_cursor.0, "dedup cursor")?),
        )?;
        txn.execute("DELETE FROM checkpoint_history WHERE key = ?1", [&key.0])?;
        txn.commit()?;

        log_fallback(key, from, &next, ack);
        Ok(next)
    }
}

#[cfg(test)]
use super::in_mem::test_checkpoint;

#[test]
fn checkpoint_and_load() {
    let store = SqliteStore::open_in_memory().unwrap();
    let token = store.acquire(&KeyRange::full(), &HolderId::from("n1")).unwrap();
    let id = RecordId::random();

    let committed = store
        .checkpoint(&test_checkpoint("x", "one", &[id], &token, 0))
        .unwrap();
    assert_eq!(committed.seq, SequenceNumber(1));

    let stored = store.load(&Key::from("x")).unwrap().unwrap();
    assert_eq!(stored.hard_state.unwrap().de::<String>().unwrap(), "one");
    assert_eq!(stored.token_epoch, Epoch(1));
    assert_eq!(stored.dedup_cursor, DedupCursor(1));
    assert!(store.dedup_contains(&Key::from("x"), &id).unwrap());

    let scanned = store.dedup_scan(&Key::from("x")).unwrap();
    assert_eq!(scanned.len(), 1);
    assert_eq!(scanned[0].record_id, id);
    assert_eq!(scanned[0].position, DedupCursor(1));
}

#[test]
fn epochs_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.sqlite3");
    let range = KeyRange::between("a", "z");

    let old = {
        let store = SqliteStore::open(&path).unwrap();
        let old = store.acquire(&range, &HolderId::from("n1")).unwrap();
        store
            .checkpoint(&test_checkpoint("cat", "one", &[RecordId::random()], &old, 0))
            .unwrap();
        old
    };

    let store = SqliteStore::open(&path).unwrap();
    let new = store.acquire(&range, &HolderId::from("n2")).unwrap();
    assert_eq!(new.epoch, Epoch(2));
    assert_eq!(store.current_epoch(&range).unwrap(), Some(Epoch(2)));

    let err = store
        .checkpoint(&test_checkpoint("cat", "zombie", &[], &old, 1))
        .unwrap_err();
    assert!(matches!(err, StoreError::StaleWriter(_)), "{err}");

    store
        .checkpoint(&test_checkpoint("cat", "two", &[], &new, 1))
        .unwrap();
    let stored = store.load(&Key::from("cat")).unwrap().unwrap();
    assert_eq!(stored.hard_state.unwrap().de::<String>().unwrap(), "two");
    assert_eq!(stored.sequence_number, SequenceNumber(2));
}

#[test]
fn torn_write_rolls_back() {
    let store = SqliteStore::open_in_memory().unwrap();
    let token = store.acquire(&KeyRange::full(), &HolderId::from("n1")).unwrap();
    let (a, b) = (RecordId::random(), RecordId::random());
    store
        .checkpoint(&test_checkpoint("x", "one", &[a], &token, 0))
        .unwrap();

    store.tear_next_checkpoint();
    let err = store
        .checkpoint(&test_checkpoint("x", "two", &[b], &token, 1))
        .unwrap_err();
    assert!(err.is_transient());

    // Neither the state nor the dedup log moved.
    let stored = store.load(&Key::from("x")).unwrap().unwrap();
    assert_eq!(stored.hard_state.unwrap().de::<String>().unwrap(), "one");
    assert_eq!(stored.sequence_number, SequenceNumber(1));
    assert_eq!(stored.dedup_cursor, DedupCursor(1));
    assert!(!store.dedup_contains(&Key::from("x"), &b).unwrap());
    assert!(store.history(&Key::from("x")).unwrap().is_empty());

    // And the same checkpoint goes through on retry.
    store
        .checkpoint(&test_checkpoint("x", "two", &[b], &token, 1))
        .unwrap();
    assert!(store.dedup_contains(&Key::from("x"), &b).unwrap());
}

#[test]
fn history_is_trimmed_and_fallback_works() {
    let store = SqliteStore::open_in_memory().unwrap().with_history(2);
    let token = store.acquire(&KeyRange::full(), &HolderId::from("n1")).unwrap();
    let ids: Vec<_> = (0..4).map(|_| RecordId::random()).collect();
    for (seq, id) in ids.iter().enumerate() {
        store
            .checkpoint(&test_checkpoint("x", &format!("s{seq}"), &[*id], &token, seq as u64))
            .unwrap();
    }
    assert_eq!(
        store.history(&Key::from("x")).unwrap(),
        vec![SequenceNumber(3), SequenceNumber(2)]
    );

    {
        let conn = store.lock();
        conn.execute(
            "UPDATE keys SET hard_state = X'00' WHERE key = ?1",
            [&Key::from("x").0],
        )
        .unwrap();
    }
    let err = store.load(&Key::from("x")).unwrap_err();
    assert!(matches!(err, StoreError::Corrupt(_)), "{err}");

    let ack = DataLossAck {
        operator: "ops".into(),
        reason: "test".into(),
    };
    let restored = store.fallback(&Key::from("x"), &token, &ack).unwrap();
    assert_eq!(restored.sequence_number, SequenceNumber(5));
    assert_eq!(restored.dedup_cursor, DedupCursor(3));
    assert_eq!(
        restored.hard_state.as_ref().unwrap().de::<String>().unwrap(),
        "s2"
    );
    assert!(!store.dedup_contains(&Key::from("x"), &ids[3]).unwrap());
    assert!(store.dedup_contains(&Key::from("x"), &ids[2]).unwrap());

    let loaded = store.load(&Key::from("x")).unwrap().unwrap();
    assert_eq!(loaded.sequence_number, restored.sequence_number);
    assert_eq!(loaded.hard_state, restored.hard_state);
    assert!(store.history(&Key::from("x")).unwrap().is_empty());
}

#[test]
fn purge_is_part_of_checkpoint() {
    let store = SqliteStore::open_in_memory().unwrap();
    let token = store.acquire(&KeyRange::full(), &HolderId::from("n1")).unwrap();
    let old = RecordId::random();

    let mut first = test_checkpoint("x", "one", &[old], &token, 0);
    first.committed_at = Utc::now() - chrono::Duration::minutes(10);
    store.checkpoint(&first).unwrap();

    let mut second = test_checkpoint("x", "two", &[], &token, 1);
    second.purge_before = Some(Utc::now() - chrono::Duration::minutes(1));
    store.tear_next_checkpoint();
    assert!(store.checkpoint(&second).is_err());
    assert!(store.dedup_contains(&Key::from("x"), &old).unwrap());

    let committed = store.checkpoint(&second).unwrap();
    assert_eq!(committed.purged, 1);
    assert!(!store.dedup_contains(&Key::from("x"), &old).unwrap());
}
