//! In-memory state store.
//!
//! All data lives behind a single mutex, which makes every
//! checkpoint trivially atomic. On top of that the store can be told
//! to misbehave with a [`Fault`], which is how tests exercise the
//! engine's retry, crash and corruption handling.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::sync::MutexGuard;

use chrono::Utc;

use super::*;
use crate::fencing::FenceTable;
use crate::fencing::FencingAuthority;
use crate::fencing::HolderId;
use crate::fencing::KeyRange;

/// Misbehavior to inject into the next checkpoint writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Reject the next `n` checkpoints as unavailable. Nothing is
    /// written.
    Unavailable(u32),
    /// Fail the next checkpoint after its state change was staged
    /// but before its dedup entries were. Nothing is written.
    TornWrite,
}

#[derive(Debug)]
struct KeyEntry {
    current: StoredKey,
    /// Older checkpoints, newest first.
    history: VecDeque<StoredKey>,
    dedup: BTreeMap<DedupCursor, DedupEntry>,
}

#[derive(Debug, Default)]
struct Inner {
    fences: FenceTable,
    keys: HashMap<Key, KeyEntry>,
    fault: Option<Fault>,
}

/// A state store with all data in memory.
#[derive(Debug)]
pub struct InMemStore {
    inner: Mutex<Inner>,
    history_len: usize,
    dedup_lookups: AtomicU64,
}

impl Default for InMemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemStore {
    pub fn new() -> Self {
        Self::with_history(2)
    }

    /// Keep up to `history_len` older checkpoints per key for
    /// [`StateStore::fallback`].
    pub fn with_history(history_len: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            history_len,
            dedup_lookups: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Misbehave on upcoming checkpoints.
    pub fn inject(&self, fault: Fault) {
        tracing::debug!("Injecting {fault:?}");
        self.lock().fault = Some(fault);
    }

    pub fn clear_faults(&self) {
        self.lock().fault = None;
    }

    /// Flip bits in the stored hard state of a key, as if the
    /// medium rotted underneath it.
    pub fn corrupt(&self, key: &Key) {
        if let Some(entry) = self.lock().keys.get_mut(key) {
            match entry.current.hard_state.as_mut() {
                Some(state) if !state.0.is_empty() => state.0[0] ^= 0x5a,
                _ => entry.current.checksum ^= 1,
            }
        }
    }

    /// How many times the durable dedup log was consulted.
    pub fn dedup_lookups(&self) -> u64 {
        self.dedup_lookups.load(Ordering::Relaxed)
    }

    /// Take the pending fault for this checkpoint, if any.
    fn take_fault(inner: &mut Inner) -> Option<Fault> {
        match inner.fault {
            Some(Fault::Unavailable(n)) => {
                inner.fault = (n > 1).then(|| Fault::Unavailable(n - 1));
                Some(Fault::Unavailable(n))
            }
            Some(Fault::TornWrite) => inner.fault.take(),
            None => None,
        }
    }
}

impl FencingAuthority for InMemStore {
    fn acquire(&self, range: &KeyRange, candidate: &HolderId) -> Result<OwnershipToken, StoreError> {
        Ok(self.lock().fences.acquire(range, candidate))
    }

    fn current_epoch(&self, range: &KeyRange) -> Result<Option<Epoch>, StoreError> {
        Ok(self.lock().fences.current(range).map(|token| token.epoch))
    }
}

impl StateStore for InMemStore {
    fn load(&self, key: &Key) -> Result<Option<StoredKey>, StoreError> {
        let inner = self.lock();
        match inner.keys.get(key) {
            Some(entry) => {
                entry.current.verify()?;
                Ok(Some(entry.current.clone()))
            }
            None => Ok(None),
        }
    }

    fn checkpoint(&self, ckpt: &Checkpoint) -> Result<Committed, StoreError> {
        let mut inner = self.lock();
        let fault = Self::take_fault(&mut inner);
        if let Some(Fault::Unavailable(n)) = fault {
            return Err(StoreError::Transient(format!(
                "injected unavailability ({n} left)"
            )));
        }

        inner.fences.check(&ckpt.token)?;
        let existing = inner.keys.get(&ckpt.key);
        check_checkpoint(
            ckpt,
            existing.map(|e| (&e.current.token_epoch, &e.current.sequence_number)),
        )?;

        let prev_cursor = existing
            .map(|e| e.current.dedup_cursor)
            .unwrap_or_default();
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

        if let Some(Fault::TornWrite) = fault {
            // The staged `next` is dropped here without ever being
            // visible, which is what a rolled back write looks like.
            tracing::debug!("Tearing checkpoint {} for key {}", next.sequence_number, next.key);
            return Err(StoreError::Transient("injected torn write".into()));
        }

        let history_len = self.history_len;
        let entry = match inner.keys.entry(ckpt.key.clone()) {
            std::collections::hash_map::Entry::Occupied(occupied) => {
                let entry = occupied.into_mut();
                let prev = std::mem::replace(&mut entry.current, next);
                entry.history.push_front(prev);
                entry.history.truncate(history_len);
                entry
            }
            std::collections::hash_map::Entry::Vacant(vacant) => vacant.insert(KeyEntry {
                current: next,
                history: VecDeque::new(),
                dedup: BTreeMap::new(),
            }),
        };

        for (i, record_id) in ckpt.dedup_append.iter().enumerate() {
            let position = prev_cursor.advance(i + 1);
            entry.dedup.insert(
                position,
                DedupEntry {
                    record_id: *record_id,
                    key: ckpt.key.clone(),
                    committed_at: ckpt.committed_at,
                    position,
                },
            );
        }

        let mut purged = 0;
        if let Some(before) = ckpt.purge_before {
            let len = entry.dedup.len();
            entry.dedup.retain(|_, e| e.committed_at >= before);
            purged = len - entry.dedup.len();
        }

        tracing::trace!(
            "Committed key {} at {} under epoch {}",
            ckpt.key,
            entry.current.sequence_number,
            ckpt.token.epoch
        );
        Ok(Committed {
            seq: entry.current.sequence_number,
            dedup_cursor: entry.current.dedup_cursor,
            purged,
        })
    }

    fn dedup_contains(&self, key: &Key, record_id: &RecordId) -> Result<bool, StoreError> {
        self.dedup_lookups.fetch_add(1, Ordering::Relaxed);
        Ok(self.lock().keys.get(key).map_or(false, |entry| {
            entry.dedup.values().any(|e| e.record_id == *record_id)
        }))
    }

    fn dedup_scan(&self, key: &Key) -> Result<Vec<DedupEntry>, StoreError> {
        Ok(self
            .lock()
            .keys
            .get(key)
            .map(|entry| entry.dedup.values().cloned().collect())
            .unwrap_or_default())
    }

    fn history(&self, key: &Key) -> Result<Vec<SequenceNumber>, StoreError> {
        Ok(self
            .lock()
            .keys
            .get(key)
            .map(|entry| entry.history.iter().map(|s| s.sequence_number).collect())
            .unwrap_or_default())
    }

    fn fallback(
        &self,
        key: &Key,
        token: &OwnershipToken,
        ack: &DataLossAck,
    ) -> Result<StoredKey, StoreError> {
        let mut inner = self.lock();
        inner.fences.check(token)?;
        if !token.key_range.contains(key) {
            return Err(StoreError::Backend(format!(
                "key {key} is outside of token range {}",
                token.key_range
            )));
        }
        let entry = inner
            .keys
            .get_mut(key)
            .ok_or_else(|| StoreError::Backend(format!("no checkpoint for key {key}")))?;

        let from = entry.current.sequence_number;
        let restored = entry
            .history
            .iter()
            .find(|older| older.verify().is_ok())
            .cloned()
            .ok_or_else(|| {
                StoreError::Backend(format!("no intact older checkpoint for key {key}"))
            })?;

        let next = StoredKey {
            token_epoch: token.epoch,
            sequence_number: from.next(),
            committed_at: Utc::now(),
            ..restored
        };
        entry.dedup.retain(|position, _| *position <= next.dedup_cursor);
        entry.history.clear();
        entry.current = next.clone();

        log_fallback(key, from, &next, ack);
        Ok(next)
    }
}

#[cfg(test)]
pub(crate) fn test_checkpoint(
    key: &str,
    state: &str,
    ids: &[RecordId],
    token: &OwnershipToken,
    expected_seq: u64,
) -> Checkpoint {
    Checkpoint {
        key: Key::from(key),
        hard_state: Some(StateBytes::ser(&state).unwrap()),
        dedup_append: ids.to_vec(),
        purge_before: None,
        productions: Vec::new(),
        token: token.clone(),
        expected_seq: SequenceNumber(expected_seq),
        committed_at: Utc::now(),
    }
}

#[test]
fn checkpoint_commits_state_and_dedup_together() {
    let store = InMemStore::new();
    let token = store.acquire(&KeyRange::full(), &HolderId::from("n1")).unwrap();
    let (a, b) = (RecordId::random(), RecordId::random());

    let committed = store
        .checkpoint(&test_checkpoint("x", "one", &[a, b], &token, 0))
        .unwrap();
    assert_eq!(committed.seq, SequenceNumber(1));
    assert_eq!(committed.dedup_cursor, DedupCursor(2));

    let stored = store.load(&Key::from("x")).unwrap().unwrap();
    assert_eq!(stored.hard_state.unwrap().de::<String>().unwrap(), "one");
    assert_eq!(stored.dedup_cursor, DedupCursor(2));
    assert!(store.dedup_contains(&Key::from("x"), &a).unwrap());
    assert!(!store.dedup_contains(&Key::from("y"), &a).unwrap());
}

#[test]
fn stale_token_has_no_effect() {
    let store = InMemStore::new();
    let range = KeyRange::between("a", "z");
    let old = store.acquire(&range, &HolderId::from("n1")).unwrap();
    let new = store.acquire(&range, &HolderId::from("n2")).unwrap();

    store
        .checkpoint(&test_checkpoint("cat", "new", &[RecordId::random()], &new, 0))
        .unwrap();
    let err = store
        .checkpoint(&test_checkpoint("cat", "zombie", &[RecordId::random()], &old, 1))
        .unwrap_err();
    assert!(matches!(err, StoreError::StaleWriter(_)), "{err}");

    let stored = store.load(&Key::from("cat")).unwrap().unwrap();
    assert_eq!(stored.hard_state.unwrap().de::<String>().unwrap(), "new");
    assert_eq!(stored.sequence_number, SequenceNumber(1));
    assert_eq!(stored.dedup_cursor, DedupCursor(1));
}

#[test]
fn sequence_conflict_is_rejected() {
    let store = InMemStore::new();
    let token = store.acquire(&KeyRange::full(), &HolderId::from("n1")).unwrap();
    store
        .checkpoint(&test_checkpoint("x", "one", &[], &token, 0))
        .unwrap();
    let err = store
        .checkpoint(&test_checkpoint("x", "again", &[], &token, 0))
        .unwrap_err();
    assert_eq!(
        err,
        StoreError::SequenceConflict {
            key: Key::from("x"),
            expected: SequenceNumber(0),
            found: SequenceNumber(1),
        }
    );
}

#[test]
fn faults_leave_store_untouched() {
    let store = InMemStore::new();
    let token = store.acquire(&KeyRange::full(), &HolderId::from("n1")).unwrap();
    let id = RecordId::random();

    store.inject(Fault::Unavailable(2));
    for _ in 0..2 {
        let err = store
            .checkpoint(&test_checkpoint("x", "one", &[id], &token, 0))
            .unwrap_err();
        assert!(err.is_transient());
    }

    store.inject(Fault::TornWrite);
    assert!(store
        .checkpoint(&test_checkpoint("x", "one", &[id], &token, 0))
        .unwrap_err()
        .is_transient());

    assert_eq!(store.load(&Key::from("x")).unwrap(), None);
    assert!(!store.dedup_contains(&Key::from("x"), &id).unwrap());

    store
        .checkpoint(&test_checkpoint("x", "one", &[id], &token, 0))
        .unwrap();
    assert!(store.dedup_contains(&Key::from("x"), &id).unwrap());
}

#[test]
fn purge_drops_old_entries_only() {
    let store = InMemStore::new();
    let token = store.acquire(&KeyRange::full(), &HolderId::from("n1")).unwrap();
    let old = RecordId::random();
    let new = RecordId::random();

    let mut first = test_checkpoint("x", "one", &[old], &token, 0);
    first.committed_at = Utc::now() - chrono::Duration::minutes(10);
    store.checkpoint(&first).unwrap();

    let mut second = test_checkpoint("x", "two", &[new], &token, 1);
    second.purge_before = Some(Utc::now() - chrono::Duration::minutes(5));
    let committed = store.checkpoint(&second).unwrap();

    assert_eq!(committed.purged, 1);
    assert_eq!(committed.dedup_cursor, DedupCursor(2));
    assert!(!store.dedup_contains(&Key::from("x"), &old).unwrap());
    assert!(store.dedup_contains(&Key::from("x"), &new).unwrap());
}

#[test]
fn corrupt_then_fallback() {
    let store = InMemStore::new();
    let token = store.acquire(&KeyRange::full(), &HolderId::from("n1")).unwrap();
    let (a, b) = (RecordId::random(), RecordId::random());
    store
        .checkpoint(&test_checkpoint("x", "one", &[a], &token, 0))
        .unwrap();
    store
        .checkpoint(&test_checkpoint("x", "two", &[b], &token, 1))
        .unwrap();
    assert_eq!(store.history(&Key::from("x")).unwrap(), vec![SequenceNumber(1)]);

    store.corrupt(&Key::from("x"));
    let err = store.load(&Key::from("x")).unwrap_err();
    assert!(matches!(err, StoreError::Corrupt(_)), "{err}");

    let ack = DataLossAck {
        operator: "ops".into(),
        reason: "disk".into(),
    };
    let restored = store.fallback(&Key::from("x"), &token, &ack).unwrap();
    assert_eq!(restored.sequence_number, SequenceNumber(3));
    assert_eq!(restored.dedup_cursor, DedupCursor(1));
    assert_eq!(
        restored.hard_state.as_ref().unwrap().de::<String>().unwrap(),
        "one"
    );
    // `b` is forgotten, so its redelivery is processed again.
    assert!(store.dedup_contains(&Key::from("x"), &a).unwrap());
    assert!(!store.dedup_contains(&Key::from("x"), &b).unwrap());
    assert_eq!(store.load(&Key::from("x")).unwrap(), Some(restored));
}
