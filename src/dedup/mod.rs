//! Record deduplication.
//!
//! A key worker asks the filter whether a record ID was already
//! committed for its key before running the user function. The answer
//! comes from a stack of [`DedupLayer`]s: a fast, possibly wrong
//! in-memory layer in front of the authoritative durable log.
//!
//! The fast layer may only ever err towards "maybe". It answers
//! [`Probe::Absent`] when it is certain the ID is new, and the record
//! is fresh without touching the store. On [`Probe::Maybe`] the
//! durable layer is consulted, and only a durable hit makes the
//! record a [`Verdict::Duplicate`]. A false positive in the fast layer
//! therefore costs a store lookup, never a dropped record.
//!
//! A [`Verdict::Fresh`] is provisional until the checkpoint that
//! appends the ID to the durable log commits. If the worker crashes
//! first, nothing was written and the redelivered record is judged
//! fresh again.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::errors::StoreError;
use crate::record::Key;
use crate::record::RecordId;
use crate::store::DedupEntry;

pub mod bloom;
pub mod durable;

pub use bloom::BloomLayer;
pub use durable::DurableLayer;

/// Answer of a single layer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Probe {
    /// Definitely never committed.
    Absent,
    /// Might have been committed; ask the next layer.
    Maybe,
    /// Definitely committed.
    Present,
}

/// Answer of the whole filter.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Verdict {
    Fresh,
    Duplicate,
}

/// One layer of the dedup filter.
pub trait DedupLayer: Send + Sync {
    fn probe(&self, key: &Key, record_id: &RecordId) -> Result<Probe, StoreError>;

    /// Note that an ID is (or is about to be) committed for a key.
    fn remember(&self, key: &Key, record_id: &RecordId);
}

/// A layer that knows nothing and always answers [`Probe::Maybe`].
///
/// Put this in front of the durable layer to disable the
/// probabilistic fast path.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughLayer;

impl DedupLayer for PassthroughLayer {
    fn probe(&self, _key: &Key, _record_id: &RecordId) -> Result<Probe, StoreError> {
        Ok(Probe::Maybe)
    }

    fn remember(&self, _key: &Key, _record_id: &RecordId) {}
}

/// Counters of how checks were decided.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DedupStats {
    /// Decided fresh by the fast layer alone.
    pub fast_fresh: u64,
    /// Went to the durable layer.
    pub durable_lookups: u64,
    /// Went to the durable layer and turned out fresh.
    pub false_positives: u64,
    pub duplicates: u64,
}

#[derive(Debug, Default)]
struct AtomicStats {
    fast_fresh: AtomicU64,
    durable_lookups: AtomicU64,
    false_positives: AtomicU64,
    duplicates: AtomicU64,
}

/// Fast layer composed in front of an authoritative one.
///
/// The second layer must never answer [`Probe::Maybe`]; if it does,
/// the record is treated as fresh, since only an authoritative hit
/// may drop a record.
pub struct TwoTierDedup {
    fast: Arc<dyn DedupLayer>,
    durable: Arc<dyn DedupLayer>,
    stats: AtomicStats,
}

impl TwoTierDedup {
    pub fn new(fast: Arc<dyn DedupLayer>, durable: Arc<dyn DedupLayer>) -> Self {
        Self {
            fast,
            durable,
            stats: AtomicStats::default(),
        }
    }

    /// Decide whether a record is fresh for its key.
    ///
    /// Fresh IDs are remembered by the fast layer right away. If the
    /// record never commits that only costs an extra durable lookup
    /// when it is redelivered.
    pub fn check_and_mark(&self, key: &Key, record_id: &RecordId) -> Result<Verdict, StoreError> {
        let verdict = match self.fast.probe(key, record_id)? {
            Probe::Absent => {
                self.stats.fast_fresh.fetch_add(1, Ordering::Relaxed);
                Verdict::Fresh
            }
            Probe::Present => Verdict::Duplicate,
            Probe::Maybe => {
                self.stats.durable_lookups.fetch_add(1, Ordering::Relaxed);
                match self.durable.probe(key, record_id)? {
                    Probe::Present => Verdict::Duplicate,
                    Probe::Absent | Probe::Maybe => {
                        tracing::trace!("Fast dedup false positive for {record_id} on key {key}");
                        self.stats.false_positives.fetch_add(1, Ordering::Relaxed);
                        Verdict::Fresh
                    }
                }
            }
        };
        match verdict {
            Verdict::Fresh => self.fast.remember(key, record_id),
            Verdict::Duplicate => {
                self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(verdict)
    }

    /// Seed the fast layer from a key's durable log, so a freshly
    /// started worker doesn't send every redelivery to the store.
    pub fn warm(&self, entries: &[DedupEntry]) {
        for entry in entries {
            self.fast.remember(&entry.key, &entry.record_id);
        }
    }

    /// Record IDs that just became durable.
    pub fn mark_committed<'a>(&self, key: &Key, ids: impl IntoIterator<Item = &'a RecordId>) {
        for id in ids {
            self.fast.remember(key, id);
            self.durable.remember(key, id);
        }
    }

    pub fn stats(&self) -> DedupStats {
        DedupStats {
            fast_fresh: self.stats.fast_fresh.load(Ordering::Relaxed),
            durable_lookups: self.stats.durable_lookups.load(Ordering::Relaxed),
            false_positives: self.stats.false_positives.load(Ordering::Relaxed),
            duplicates: self.stats.duplicates.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
use crate::fencing::{FencingAuthority, HolderId, KeyRange};
#[cfg(test)]
use crate::store::{in_mem::test_checkpoint, InMemStore, StateStore};

#[cfg(test)]
fn committed_store(key: &str, ids: &[RecordId]) -> Arc<InMemStore> {
    let store = Arc::new(InMemStore::new());
    let token = store.acquire(&KeyRange::full(), &HolderId::from("n1")).unwrap();
    store
        .checkpoint(&test_checkpoint(key, "s", ids, &token, 0))
        .unwrap();
    store
}

#[test]
fn fast_absent_skips_the_store() {
    let store = committed_store("x", &[]);
    let dedup = TwoTierDedup::new(
        Arc::new(BloomLayer::new(1 << 12, 4)),
        Arc::new(DurableLayer::new(store.clone())),
    );

    let id = RecordId::random();
    assert_eq!(
        dedup.check_and_mark(&Key::from("x"), &id).unwrap(),
        Verdict::Fresh
    );
    assert_eq!(store.dedup_lookups(), 0);
    assert_eq!(dedup.stats().fast_fresh, 1);
}

#[test]
fn false_positive_never_drops_a_fresh_record() {
    let store = committed_store("x", &[]);
    // Every lookup looks like a possible hit.
    let dedup = TwoTierDedup::new(
        Arc::new(PassthroughLayer),
        Arc::new(DurableLayer::new(store.clone())),
    );

    let id = RecordId::random();
    assert_eq!(
        dedup.check_and_mark(&Key::from("x"), &id).unwrap(),
        Verdict::Fresh
    );
    assert_eq!(store.dedup_lookups(), 1);
    assert_eq!(dedup.stats().false_positives, 1);
}

#[test]
fn saturated_bloom_still_falls_through_to_the_log() {
    let store = committed_store("x", &[]);
    let bloom = Arc::new(BloomLayer::new(64, 1));
    for _ in 0..1024 {
        bloom.remember(&Key::from("x"), &RecordId::random());
    }
    let dedup = TwoTierDedup::new(bloom, Arc::new(DurableLayer::new(store.clone())));

    for _ in 0..10 {
        assert_eq!(
            dedup.check_and_mark(&Key::from("x"), &RecordId::random()).unwrap(),
            Verdict::Fresh
        );
    }
    assert_eq!(store.dedup_lookups(), 10);
}

#[test]
fn durable_hit_is_duplicate() {
    let id = RecordId::random();
    let store = committed_store("x", &[id]);
    let dedup = TwoTierDedup::new(
        Arc::new(BloomLayer::new(1 << 12, 4)),
        Arc::new(DurableLayer::new(store.clone())),
    );
    dedup.warm(&store.dedup_scan(&Key::from("x")).unwrap());

    assert_eq!(
        dedup.check_and_mark(&Key::from("x"), &id).unwrap(),
        Verdict::Duplicate
    );
    // Same ID under a different key is unrelated.
    assert_eq!(
        dedup.check_and_mark(&Key::from("y"), &id).unwrap(),
        Verdict::Fresh
    );
    assert_eq!(dedup.stats().duplicates, 1);
}

#[test]
fn fresh_verdict_is_provisional_until_commit() {
    let store = committed_store("x", &[]);
    let dedup = TwoTierDedup::new(
        Arc::new(BloomLayer::new(1 << 12, 4)),
        Arc::new(DurableLayer::new(store.clone())),
    );
    let id = RecordId::random();

    assert_eq!(
        dedup.check_and_mark(&Key::from("x"), &id).unwrap(),
        Verdict::Fresh
    );
    // Never committed, so the redelivery is fresh again, after
    // checking the log.
    assert_eq!(
        dedup.check_and_mark(&Key::from("x"), &id).unwrap(),
        Verdict::Fresh
    );
    assert_eq!(store.dedup_lookups(), 1);
}
