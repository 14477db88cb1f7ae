//! Checkpoint scheduling and commit.
//!
//! A key worker hands every fresh record's dedup ID, productions, and
//! reply to a [`Batch`]. The [`CheckpointCoordinator`] decides when a
//! batch must be committed according to the [`CheckpointPolicy`], and
//! writes it to the store as one [`Checkpoint`] together with the
//! key's state.
//!
//! Transient store failures are retried here with backoff and never
//! reach the worker unless the whole retry budget is spent. Expired
//! dedup entries are purged by piggybacking a `purge_before` cutoff
//! on a regular checkpoint, so a purge is exactly as atomic as any
//! other state change.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use tokio::time::Instant;

use crate::config::CheckpointPolicy;
use crate::config::EngineConfig;
use crate::config::StoreRetryConfig;
use crate::errors::StoreError;
use crate::metrics::NodeMetrics;
use crate::record::Record;
use crate::record::RecordId;
use crate::retry::retry_transient;
use crate::store::blocking;
use crate::store::Checkpoint;
use crate::store::Committed;
use crate::store::StateStore;

/// Records processed since a key's last checkpoint.
///
/// `W` is whatever the worker needs to reply to once the batch
/// commits.
#[derive(Debug)]
pub struct Batch<W> {
    ids: Vec<RecordId>,
    id_set: HashSet<RecordId>,
    productions: Vec<Record>,
    waiters: Vec<W>,
    opened_at: Option<Instant>,
}

impl<W> Default for Batch<W> {
    fn default() -> Self {
        Self {
            ids: Vec::new(),
            id_set: HashSet::new(),
            productions: Vec::new(),
            waiters: Vec::new(),
            opened_at: None,
        }
    }
}

impl<W> Batch<W> {
    /// Add a freshly processed record.
    pub fn push(&mut self, id: RecordId, productions: Vec<Record>, waiter: W) {
        self.opened_at.get_or_insert_with(Instant::now);
        self.ids.push(id);
        self.id_set.insert(id);
        self.productions.extend(productions);
        self.waiters.push(waiter);
    }

    /// Whether a record is waiting in this batch.
    pub fn contains(&self, id: &RecordId) -> bool {
        self.id_set.contains(id)
    }

    /// Wait for this batch without adding a record, e.g. for a
    /// redelivery of a record already in it.
    pub fn wait(&mut self, waiter: W) {
        self.waiters.push(waiter);
    }

    /// Number of records, not counting extra waiters.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty() && self.waiters.is_empty()
    }

    pub fn ids(&self) -> &[RecordId] {
        &self.ids
    }

    pub fn productions(&self) -> &[Record] {
        &self.productions
    }

    /// Empty the batch, handing back its waiters.
    pub fn take_waiters(&mut self) -> Vec<W> {
        let waiters = std::mem::take(&mut self.waiters);
        *self = Self::default();
        waiters
    }
}

/// When a key last purged its dedup log.
#[derive(Debug, Default, Clone, Copy)]
pub struct PurgeSchedule {
    last_purge: Option<Instant>,
}

/// Turns batches into checkpoints and commits them.
pub struct CheckpointCoordinator {
    store: Arc<dyn StateStore>,
    policy: CheckpointPolicy,
    retry: StoreRetryConfig,
    retention: Duration,
    purge_interval: Duration,
}

impl CheckpointCoordinator {
    pub fn new(store: Arc<dyn StateStore>, config: &EngineConfig) -> Self {
        Self {
            store,
            policy: config.checkpoint,
            retry: config.store_retry.clone(),
            retention: config.dedup.retention,
            purge_interval: config.dedup.purge_interval,
        }
    }

    pub fn policy(&self) -> CheckpointPolicy {
        self.policy
    }

    /// Whether a batch has to be committed before taking more records.
    pub fn must_commit<W>(&self, batch: &Batch<W>) -> bool {
        match self.policy {
            CheckpointPolicy::PerRecord => !batch.is_empty(),
            CheckpointPolicy::Interval { max_batch, .. } => batch.len() >= max_batch,
        }
    }

    /// When an open batch has to be committed at the latest.
    pub fn deadline<W>(&self, batch: &Batch<W>) -> Option<Instant> {
        match self.policy {
            CheckpointPolicy::PerRecord => batch.opened_at,
            CheckpointPolicy::Interval { interval, .. } => {
                batch.opened_at.map(|opened_at| opened_at + interval)
            }
        }
    }

    /// Dedup cutoff to purge with a checkpoint committed at
    /// `committed_at`, if a purge is due.
    ///
    /// Entries committed at exactly the cutoff are kept, so a
    /// checkpoint never purges the entries it appends itself.
    pub fn purge_before(
        &self,
        schedule: &mut PurgeSchedule,
        committed_at: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let now = Instant::now();
        let due = schedule
            .last_purge
            .map_or(true, |last| now.duration_since(last) >= self.purge_interval);
        if !due {
            return None;
        }
        let retention = chrono::Duration::from_std(self.retention).ok()?;
        schedule.last_purge = Some(now);
        committed_at.checked_sub_signed(retention)
    }

    /// Earliest time an idle key with entries committed at `oldest`
    /// has anything to purge, given when it purged last.
    ///
    /// `None` if entries never expire on their own, which is the case
    /// with a zero retention: those are purged with every commit.
    pub fn sweep_at(
        &self,
        schedule: &PurgeSchedule,
        oldest: DateTime<Utc>,
    ) -> Option<Instant> {
        if self.retention.is_zero() {
            return None;
        }
        let expires = oldest + chrono::Duration::from_std(self.retention).ok()?;
        // Entries committed exactly at the cutoff are kept.
        let wait = (expires - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
            + Duration::from_millis(1);
        let now = Instant::now();
        let expired_at = now + wait;
        Some(match schedule.last_purge {
            Some(last) => expired_at.max(last + self.purge_interval),
            None => expired_at,
        })
    }

    /// Write a checkpoint, retrying transient failures.
    ///
    /// A transient error is only returned once the retry budget is
    /// spent. Nothing was written in that case, and the same
    /// checkpoint can be tried again later.
    #[tracing::instrument(name = "checkpoint", skip_all, fields(key = %ckpt.key, seq = %ckpt.expected_seq))]
    pub async fn commit(
        &self,
        ckpt: Checkpoint,
        metrics: &NodeMetrics,
    ) -> Result<Committed, StoreError> {
        let ckpt = Arc::new(ckpt);
        retry_transient(&self.retry.backoff, self.retry.max_attempts, |attempt| {
            if attempt > 0 {
                metrics.store_retries.add(1, &metrics.labels);
            }
            let store = self.store.clone();
            let ckpt = ckpt.clone();
            blocking(move || store.checkpoint(&ckpt))
        })
        .await
    }
}

#[cfg(test)]
fn interval_config(interval: Duration, max_batch: usize) -> EngineConfig {
    EngineConfig {
        checkpoint: CheckpointPolicy::Interval {
            interval,
            max_batch,
        },
        ..Default::default()
    }
}

#[test]
fn per_record_commits_every_record() {
    let coordinator =
        CheckpointCoordinator::new(Arc::new(crate::store::InMemStore::new()), &Default::default());
    let mut batch = Batch::default();
    assert!(!coordinator.must_commit(&batch));
    batch.push(RecordId::random(), Vec::new(), ());
    assert!(coordinator.must_commit(&batch));
}

#[test]
fn interval_commits_on_size() {
    let coordinator = CheckpointCoordinator::new(
        Arc::new(crate::store::InMemStore::new()),
        &interval_config(Duration::from_secs(1), 2),
    );
    let mut batch = Batch::default();
    let first = RecordId::random();
    batch.push(first, Vec::new(), 1);
    assert!(!coordinator.must_commit(&batch));
    assert!(batch.contains(&first));
    assert!(coordinator.deadline(&batch).is_some());

    // Extra waiters don't count towards the size.
    batch.wait(2);
    assert!(!coordinator.must_commit(&batch));
    batch.push(RecordId::random(), Vec::new(), 3);
    assert!(coordinator.must_commit(&batch));

    assert_eq!(batch.take_waiters(), vec![1, 2, 3]);
    assert!(batch.is_empty());
    assert!(!batch.contains(&first));
    assert_eq!(coordinator.deadline(&batch), None);
}

#[tokio::test(start_paused = true)]
async fn purge_is_rate_limited() {
    let mut config = EngineConfig::default();
    config.dedup.retention = Duration::from_secs(60);
    config.dedup.purge_interval = Duration::from_secs(10);
    let coordinator = CheckpointCoordinator::new(Arc::new(crate::store::InMemStore::new()), &config);
    let mut schedule = PurgeSchedule::default();
    let now = Utc::now();

    assert_eq!(
        coordinator.purge_before(&mut schedule, now),
        Some(now - chrono::Duration::seconds(60))
    );
    assert_eq!(coordinator.purge_before(&mut schedule, now), None);
    tokio::time::advance(Duration::from_secs(10)).await;
    assert!(coordinator.purge_before(&mut schedule, now).is_some());
}

#[tokio::test(start_paused = true)]
async fn commit_retries_transient_failures() {
    use crate::fencing::{FencingAuthority, HolderId, KeyRange};
    use crate::store::{in_mem::test_checkpoint, Fault, InMemStore};

    let store = Arc::new(InMemStore::new());
    let token = store.acquire(&KeyRange::full(), &HolderId::from("n1")).unwrap();
    let coordinator = CheckpointCoordinator::new(store.clone(), &EngineConfig::default());
    let metrics = NodeMetrics::new("n1");

    store.inject(Fault::Unavailable(3));
    let committed = coordinator
        .commit(test_checkpoint("x", "one", &[RecordId::random()], &token, 0), &metrics)
        .await
        .unwrap();
    assert_eq!(committed.seq, crate::store::SequenceNumber(1));

    // Past the budget the error surfaces, with nothing written.
    store.inject(Fault::Unavailable(100));
    let err = coordinator
        .commit(test_checkpoint("x", "two", &[], &token, 1), &metrics)
        .await
        .unwrap_err();
    assert!(err.is_transient());
    store.clear_faults();
    assert_eq!(
        store.load(&"x".into()).unwrap().unwrap().sequence_number,
        crate::store::SequenceNumber(1)
    );
}

#[tokio::test(start_paused = true)]
async fn idle_sweep_waits_for_expiry_and_schedule() {
    let mut config = EngineConfig::default();
    config.dedup.retention = Duration::from_secs(60);
    config.dedup.purge_interval = Duration::from_secs(600);
    let coordinator = CheckpointCoordinator::new(Arc::new(crate::store::InMemStore::new()), &config);
    let mut schedule = PurgeSchedule::default();

    let start = Instant::now();
    let oldest = Utc::now() - chrono::Duration::seconds(30);
    let at = coordinator.sweep_at(&schedule, oldest).unwrap();
    assert!(at >= start + Duration::from_secs(29), "{:?}", at - start);
    assert!(at <= start + Duration::from_secs(31), "{:?}", at - start);

    // Already expired, but the last purge was just now.
    coordinator.purge_before(&mut schedule, Utc::now());
    let long_ago = Utc::now() - chrono::Duration::seconds(3600);
    assert_eq!(
        coordinator.sweep_at(&schedule, long_ago),
        Some(start + Duration::from_secs(600))
    );

    config.dedup.retention = Duration::ZERO;
    let coordinator = CheckpointCoordinator::new(Arc::new(crate::store::InMemStore::new()), &config);
    assert_eq!(coordinator.sweep_at(&PurgeSchedule::default(), long_ago), None);
}
