//! Probabilistic in-memory dedup layer.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use super::*;

type Bits = Box<[AtomicU64]>;

fn empty_bits(words: usize) -> Bits {
    (0..words).map(|_| AtomicU64::new(0)).collect()
}

/// When the older generation is dropped.
struct Rotation {
    window: Duration,
    next: Mutex<Instant>,
}

/// Bloom filter over `(key, record ID)` pairs.
///
/// Bits are atomics so lookups and inserts from many key workers don't
/// need a lock. Bits are only ever set, never cleared individually, so
/// a concurrent insert can at worst make a lookup answer
/// [`Probe::Maybe`] early.
///
/// A rotating filter keeps two generations. Inserts go to the current
/// one and lookups check both. Once per window the older generation
/// is cleared and becomes the current one, so an entry is kept for at
/// least one window after it was last remembered and the filter never
/// fills up on a long running node. With the window set to the dedup
/// retention, an entry only drops out once its durable entry is due
/// for purging.
pub struct BloomLayer {
    generations: [Bits; 2],
    current: AtomicUsize,
    hashes: u32,
    rotation: Option<Rotation>,
}

impl BloomLayer {
    /// A filter of at least `bits` bits using `hashes` hash
    /// functions that never forgets.
    pub fn new(bits: usize, hashes: u32) -> Self {
        let words = ((bits + 63) / 64).max(1);
        Self {
            generations: [empty_bits(words), empty_bits(1)],
            current: AtomicUsize::new(0),
            hashes: hashes.max(1),
            rotation: None,
        }
    }

    /// A filter with two generations of at least `bits` bits each,
    /// rotated every `window`. A zero window never rotates.
    pub fn rotating(bits: usize, hashes: u32, window: Duration) -> Self {
        if window.is_zero() {
            return Self::new(bits, hashes);
        }
        let words = ((bits + 63) / 64).max(1);
        Self {
            generations: [empty_bits(words), empty_bits(words)],
            current: AtomicUsize::new(0),
            hashes: hashes.max(1),
            rotation: Some(Rotation {
                window,
                next: Mutex::new(Instant::now() + window),
            }),
        }
    }

    fn bit_count(&self) -> u64 {
        self.generations[0].len() as u64 * 64
    }

    /// Bit positions of an entry, by double hashing.
    fn positions(&self, key: &Key, record_id: &RecordId) -> impl Iterator<Item = (usize, u64)> {
        let mut buf = Vec::with_capacity(key.as_bytes().len() + 16);
        buf.extend_from_slice(record_id.as_bytes());
        buf.extend_from_slice(key.as_bytes());
        let h1 = seahash::hash(&buf);
        let h2 = seahash::hash_seeded(
            &buf,
            0x243f_6a88_85a3_08d3,
            0x1319_8a2e_0370_7344,
            0xa409_3822_299f_31d0,
            0x082e_fa98_ec4e_6c89,
        ) | 1;
        let bit_count = self.bit_count();

        (0..self.hashes as u64).map(move |i| {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % bit_count;
            ((bit / 64) as usize, 1u64 << (bit % 64))
        })
    }

    /// Drop the older generation if its window has passed, or both if
    /// the filter sat idle for a whole window since.
    fn maybe_rotate(&self) {
        let Some(rotation) = &self.rotation else {
            return;
        };
        let now = Instant::now();
        let mut next = rotation
            .next
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if now < *next {
            return;
        }

        let current = self.current.load(Ordering::Acquire);
        let older = 1 - current;
        clear(&self.generations[older]);
        if now.duration_since(*next) >= rotation.window {
            clear(&self.generations[current]);
        }
        self.current.store(older, Ordering::Release);
        *next = now + rotation.window;
        tracing::trace!("Rotated dedup filter to generation {older}");
    }

    fn live(&self) -> &[Bits] {
        if self.rotation.is_some() {
            &self.generations
        } else {
            &self.generations[..1]
        }
    }

    /// Fraction of bits set. A rough measure of the false positive
    /// rate to expect.
    pub fn fill_ratio(&self) -> f64 {
        self.maybe_rotate();
        let live = self.live();
        let set: u64 = live
            .iter()
            .flat_map(|bits| bits.iter())
            .map(|word| word.load(Ordering::Relaxed).count_ones() as u64)
            .sum();
        set as f64 / (self.bit_count() * live.len() as u64) as f64
    }
}

fn clear(bits: &Bits) {
    for word in bits.iter() {
        word.store(0, Ordering::Relaxed);
    }
}

impl DedupLayer for BloomLayer {
    fn probe(&self, key: &Key, record_id: &RecordId) -> Result<Probe, StoreError> {
        self.maybe_rotate();
        let positions: Vec<_> = self.positions(key, record_id).collect();
        let hit = self.live().iter().any(|bits| {
            positions
                .iter()
                .all(|(word, mask)| bits[*word].load(Ordering::Relaxed) & mask != 0)
        });
        Ok(if hit { Probe::Maybe } else { Probe::Absent })
    }

    fn remember(&self, key: &Key, record_id: &RecordId) {
        self.maybe_rotate();
        let bits = &self.generations[self.current.load(Ordering::Acquire)];
        for (word, mask) in self.positions(key, record_id) {
            bits[word].fetch_or(mask, Ordering::Relaxed);
        }
    }
}

#[test]
fn no_false_negatives() {
    let bloom = BloomLayer::new(1 << 16, 7);
    let key = Key::from("x");
    let ids: Vec<_> = (0..1000).map(|_| RecordId::random()).collect();
    for id in &ids {
        bloom.remember(&key, id);
    }
    for id in &ids {
        assert_eq!(bloom.probe(&key, id).unwrap(), Probe::Maybe);
    }
}

#[test]
fn empty_filter_is_certain() {
    let bloom = BloomLayer::new(1024, 3);
    assert_eq!(
        bloom.probe(&Key::from("x"), &RecordId::random()).unwrap(),
        Probe::Absent
    );
    assert_eq!(bloom.fill_ratio(), 0.0);
}

#[test]
fn false_positive_rate_is_sane() {
    // ~10 bits per entry with 7 hashes is about 1%.
    let bloom = BloomLayer::new(10_000, 7);
    let key = Key::from("x");
    for _ in 0..1000 {
        bloom.remember(&key, &RecordId::random());
    }
    let hits = (0..10_000)
        .filter(|_| bloom.probe(&key, &RecordId::random()).unwrap() == Probe::Maybe)
        .count();
    assert!(hits < 500, "{hits} false positives out of 10000");
}

#[tokio::test(start_paused = true)]
async fn entries_outlive_one_window() {
    let window = Duration::from_secs(60);
    let bloom = BloomLayer::rotating(1 << 16, 7, window);
    let key = Key::from("x");
    let old = RecordId::random();
    bloom.remember(&key, &old);

    tokio::time::advance(window).await;
    let recent = RecordId::random();
    bloom.remember(&key, &recent);
    assert_eq!(bloom.probe(&key, &old).unwrap(), Probe::Maybe);
    assert_eq!(bloom.probe(&key, &recent).unwrap(), Probe::Maybe);

    tokio::time::advance(window).await;
    assert_eq!(bloom.probe(&key, &old).unwrap(), Probe::Absent);
    assert_eq!(bloom.probe(&key, &recent).unwrap(), Probe::Maybe);

    // Idle for longer than a window forgets everything.
    tokio::time::advance(window * 3).await;
    assert_eq!(bloom.probe(&key, &recent).unwrap(), Probe::Absent);
}

#[tokio::test(start_paused = true)]
async fn churn_does_not_saturate() {
    let window = Duration::from_secs(60);
    let bloom = BloomLayer::rotating(1 << 14, 7, window);
    let key = Key::from("x");
    let mut peak: f64 = 0.0;
    for _ in 0..20 {
        for _ in 0..500 {
            bloom.remember(&key, &RecordId::random());
        }
        peak = peak.max(bloom.fill_ratio());
        tokio::time::advance(window).await;
    }
    // 1000 live entries at most over 2 * 16384 bits with 7 hashes.
    assert!(peak < 0.4, "fill ratio reached {peak}");

    let never_rotated = BloomLayer::new(1 << 14, 7);
    for _ in 0..10_000 {
        never_rotated.remember(&key, &RecordId::random());
    }
    assert!(never_rotated.fill_ratio() > 0.9);
}
