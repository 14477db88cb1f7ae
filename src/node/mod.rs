//! Computation node: runs the user function for owned keys and drives
//! the commit protocol.
//!
//! A node owns zero or more key-ranges, each under an
//! [`OwnershipToken`] from the fencing authority. Each key of an owned
//! range that has seen a record gets its own tokio task, the key
//! worker. Key workers run independently of each other; within a key,
//! records are handled one at a time in the order the worker's channel
//! receives them.
//!
//! For every record a key worker:
//!
//! 1. Validates its token. If it is stale, the whole range is
//!    suspended: every key worker of the range stops, drops its soft
//!    state, and rejects whatever it still had pending.
//!
//! 2. Checks the dedup filter. A duplicate is acked right away without
//!    running the user function or writing anything.
//!
//! 3. Applies the user function to its soft state, buffering any
//!    downstream records.
//!
//! 4. Checkpoints the new state together with the record's dedup
//!    entry. Only after the checkpoint commits are the buffered records
//!    sent downstream, and only once downstream took all of them is the
//!    record acked upstream. If fencing rejects the checkpoint the
//!    result is abandoned and the range suspended.
//!
//! A crash anywhere before step 4 commits leaves the store exactly as
//! it was, and the record is redone from the last checkpoint when it
//! is redelivered. A crash after the commit but before the buffered
//! records were sent is covered by keeping them in the checkpoint: a
//! key worker starting up sends its last checkpoint's records again,
//! and their deterministic IDs let downstream dedup them.
//!
//! Stale tokens and corrupt checkpoints are reported to the node's
//! supervisor as [`SupervisorEvent`]s. Transient store failures are
//! retried and only reported if they go on for long.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use arc_swap::ArcSwapOption;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::checkpoint::CheckpointCoordinator;
use crate::config::EngineConfig;
use crate::dedup::BloomLayer;
use crate::dedup::DedupLayer;
use crate::dedup::DurableLayer;
use crate::dedup::PassthroughLayer;
use crate::dedup::TwoTierDedup;
use crate::delivery::sender::AckHandle;
use crate::delivery::sender::Sender;
use crate::delivery::sender::Transport;
use crate::errors::Backpressure;
use crate::errors::CorruptCheckpoint;
use crate::errors::EngineError;
use crate::errors::LogicError;
use crate::errors::StoreError;
use crate::fencing::Epoch;
use crate::fencing::FencingAuthority;
use crate::fencing::HolderId;
use crate::fencing::KeyRange;
use crate::fencing::OwnershipToken;
use crate::metrics::NodeMetrics;
use crate::record::Key;
use crate::record::Record;
use crate::retry::retry_transient;
use crate::store::blocking;
use crate::store::DataLossAck;
use crate::store::DedupCursor;
use crate::store::SequenceNumber;
use crate::store::StateBytes;
use crate::store::StateStore;
use crate::store::StoredKey;

pub mod logic;
mod worker;

#[cfg(test)]
mod scenarios;

pub use logic::Applied;
pub use logic::CountLogic;
pub use logic::Emit;
pub use logic::Logic;

use worker::KeyWorker;
use worker::Msg;
use worker::Reply;

/// Where a key is in the commit protocol.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPhase {
    Idle,
    Processing,
    Committing,
    /// The range's token was superseded. Nothing more is processed
    /// until the range is acquired again.
    Suspended,
    /// The key's checkpoint is corrupt. Nothing more is processed
    /// until an operator intervenes.
    Halted,
}

/// What happened to a record given to [`ComputationNode::process`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The record's effects are committed under this sequence number
    /// and its downstream records sent.
    Committed(SequenceNumber),
    /// The record was already committed before.
    Duplicate,
    /// The record was not processed.
    Rejected(Rejection),
    /// The user function failed on this record. Nothing was
    /// committed.
    Failed(LogicError),
}

impl Outcome {
    /// Whether the upstream sender may stop redelivering.
    pub fn should_ack(&self) -> bool {
        matches!(self, Self::Committed(_) | Self::Duplicate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// No range containing the key is owned by this node.
    NotOwned,
    /// The range was suspended or released.
    Suspended,
    /// The key is halted on a corrupt checkpoint.
    Corrupt,
}

/// Reported to whoever supervises the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// The node lost a range. `cause` is the fencing rejection that
    /// gave it away.
    Suspended {
        token: OwnershipToken,
        cause: StoreError,
    },
    /// A key's checkpoint failed verification. The key is halted.
    Corrupt(CorruptCheckpoint),
    /// A key couldn't reach the store within its retry budget and
    /// keeps retrying.
    Stalled { key: Key, error: StoreError },
}

/// Where committed records go.
pub trait Downstream: Send + Sync + 'static {
    /// Must not block. May be called again with the same record.
    ///
    /// On [`Backpressure`] the record was not taken. The key worker
    /// offers it again and holds back the upstream ack of the records
    /// that produced it until it is.
    fn send(&self, record: Record) -> Result<(), Backpressure>;
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct Discard;

impl Downstream for Discard {
    fn send(&self, _record: Record) -> Result<(), Backpressure> {
        Ok(())
    }
}

impl Downstream for mpsc::UnboundedSender<Record> {
    fn send(&self, record: Record) -> Result<(), Backpressure> {
        if mpsc::UnboundedSender::send(self, record).is_err() {
            tracing::warn!("Downstream receiver dropped");
        }
        Ok(())
    }
}

impl Downstream for Sender {
    fn send(&self, record: Record) -> Result<(), Backpressure> {
        self.submit(record)
    }
}

/// Committed state of a key as of its last checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedView {
    pub seq: SequenceNumber,
    pub dedup_cursor: DedupCursor,
    pub epoch: Epoch,
    pub hard_state: Option<StateBytes>,
}

impl CommittedView {
    fn from_stored(stored: &StoredKey) -> Self {
        Self {
            seq: stored.sequence_number,
            dedup_cursor: stored.dedup_cursor,
            epoch: stored.token_epoch,
            hard_state: stored.hard_state.clone(),
        }
    }

    pub fn state<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        self.hard_state
            .as_ref()
            .map(|bytes| bytes.de::<T>())
            .transpose()
    }
}

/// Lock-free reader of a key's [`CommittedView`].
///
/// Loading never waits on the key's worker, even mid-checkpoint; it
/// sees the last committed view.
#[derive(Clone)]
pub struct CommittedReader(Arc<ArcSwapOption<CommittedView>>);

impl CommittedReader {
    pub fn load(&self) -> Option<Arc<CommittedView>> {
        self.0.load_full()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KeyStatus {
    pub phase: KeyPhase,
    pub epoch: Epoch,
    pub seq: SequenceNumber,
}

/// Phases of every key that has a worker, for inspection.
#[derive(Debug, Default)]
pub(crate) struct StatusTable(Mutex<BTreeMap<Key, KeyStatus>>);

impl StatusTable {
    fn lock(&self) -> MutexGuard<'_, BTreeMap<Key, KeyStatus>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a key's status, unless a worker under a newer epoch
    /// already took the entry over.
    pub(crate) fn set(&self, key: &Key, status: KeyStatus) {
        let mut table = self.lock();
        match table.get(key) {
            Some(current) if current.epoch > status.epoch => {}
            _ => {
                table.insert(key.clone(), status);
            }
        }
    }

    fn get(&self, key: &Key) -> Option<KeyStatus> {
        self.lock().get(key).copied()
    }

    fn mark_range(&self, range: &KeyRange, phase: KeyPhase) {
        for (_, status) in self.lock().iter_mut().filter(|(key, _)| range.contains(key)) {
            status.phase = phase;
        }
    }

    fn remove_range(&self, range: &KeyRange) {
        self.lock().retain(|key, _| !range.contains(key));
    }

    fn snapshot(&self) -> Vec<(Key, KeyStatus)> {
        self.lock()
            .iter()
            .map(|(key, status)| (key.clone(), *status))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RangeStatus {
    pub range: String,
    pub epoch: Epoch,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyStatusEntry {
    pub key: String,
    #[serde(flatten)]
    pub status: KeyStatus,
}

/// Snapshot of a node for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub holder: HolderId,
    pub ranges: Vec<RangeStatus>,
    pub keys: Vec<KeyStatusEntry>,
}

/// Anything that can describe itself on the status API.
pub trait StatusSource: Send + Sync + 'static {
    fn status(&self) -> NodeStatus;
}

/// State shared by a node and all of its key workers.
pub(crate) struct Shared<L: Logic> {
    holder: HolderId,
    logic: L,
    store: Arc<dyn StateStore>,
    fencing: Arc<dyn FencingAuthority>,
    dedup: TwoTierDedup,
    coordinator: CheckpointCoordinator,
    downstream: Arc<dyn Downstream>,
    config: EngineConfig,
    status: StatusTable,
    views: Mutex<HashMap<Key, Arc<ArcSwapOption<CommittedView>>>>,
    supervisor: mpsc::UnboundedSender<SupervisorEvent>,
    metrics: NodeMetrics,
}

impl<L: Logic> Shared<L> {
    fn views(&self) -> MutexGuard<'_, HashMap<Key, Arc<ArcSwapOption<CommittedView>>>> {
        self.views
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn report(&self, event: SupervisorEvent) {
        if self.supervisor.send(event).is_err() {
            tracing::debug!("Supervisor of {} is gone; event dropped", self.holder);
        }
    }
}

struct WorkerHandle {
    tx: mpsc::Sender<Msg>,
    task: JoinHandle<()>,
}

/// A range this node holds a token for.
struct Owned {
    token: OwnershipToken,
    /// Set once the range is given up. Workers reject anything they
    /// still get after that.
    suspended: Arc<AtomicBool>,
    workers: HashMap<Key, WorkerHandle>,
}

impl Owned {
    fn new(token: OwnershipToken) -> Self {
        Self {
            token,
            suspended: Arc::new(AtomicBool::new(false)),
            workers: HashMap::new(),
        }
    }

    /// Stop taking records. In-flight work finishes on its own and
    /// its commit is fenced if the token is stale.
    fn retire(self) {
        self.suspended.store(true, Ordering::SeqCst);
        drop(self.workers);
    }
}

/// Runs a [`Logic`] over the records of the ranges it owns.
///
/// Cheap to clone; clones share everything.
pub struct ComputationNode<L: Logic> {
    shared: Arc<Shared<L>>,
    ranges: Arc<Mutex<BTreeMap<KeyRange, Owned>>>,
}

impl<L: Logic> Clone for ComputationNode<L> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            ranges: self.ranges.clone(),
        }
    }
}

impl<L: Logic> ComputationNode<L> {
    /// Create a node using one store for both state and fencing.
    ///
    /// Returns the receiving end of the node's supervisor events.
    pub fn new<S>(
        holder: HolderId,
        logic: L,
        store: Arc<S>,
        downstream: Arc<dyn Downstream>,
        config: EngineConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SupervisorEvent>), EngineError>
    where
        S: StateStore + FencingAuthority + 'static,
    {
        let fast: Arc<dyn DedupLayer> = if config.dedup.probabilistic {
            Arc::new(BloomLayer::rotating(
                config.dedup.bloom_bits,
                config.dedup.bloom_hashes,
                config.dedup.retention,
            ))
        } else {
            Arc::new(PassthroughLayer)
        };
        Self::from_parts(holder, logic, store.clone(), store, fast, downstream, config)
    }

    /// Create a node from individually chosen collaborators.
    pub fn from_parts(
        holder: HolderId,
        logic: L,
        store: Arc<dyn StateStore>,
        fencing: Arc<dyn FencingAuthority>,
        fast_dedup: Arc<dyn DedupLayer>,
        downstream: Arc<dyn Downstream>,
        config: EngineConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SupervisorEvent>), EngineError> {
        config.validate()?;
        let (supervisor, events) = mpsc::unbounded_channel();
        let shared = Shared {
            metrics: NodeMetrics::new(&holder.0),
            holder,
            logic,
            dedup: TwoTierDedup::new(fast_dedup, Arc::new(DurableLayer::new(store.clone()))),
            coordinator: CheckpointCoordinator::new(store.clone(), &config),
            store,
            fencing,
            downstream,
            config,
            status: StatusTable::default(),
            views: Mutex::new(HashMap::new()),
            supervisor,
        };
        let node = Self {
            shared: Arc::new(shared),
            ranges: Arc::new(Mutex::new(BTreeMap::new())),
        };
        Ok((node, events))
    }

    fn ranges(&self) -> MutexGuard<'_, BTreeMap<KeyRange, Owned>> {
        self.ranges
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn holder(&self) -> &HolderId {
        &self.shared.holder
    }

    /// Take over a range, fencing out whoever held it before.
    ///
    /// If this node already held the range, its key workers for it are
    /// retired first; they were working under the older token.
    pub async fn acquire(&self, range: KeyRange) -> Result<OwnershipToken, EngineError> {
        let retry = &self.shared.config.store_retry;
        let token = retry_transient(&retry.backoff, retry.max_attempts, |_| {
            let fencing = self.shared.fencing.clone();
            let range = range.clone();
            let holder = self.shared.holder.clone();
            blocking(move || fencing.acquire(&range, &holder))
        })
        .await?;

        let prev = self.ranges().insert(range.clone(), Owned::new(token.clone()));
        if let Some(prev) = prev {
            tracing::debug!("Retiring workers of {range} under epoch {}", prev.token.epoch);
            prev.retire();
            self.forget_range(&range);
        }
        tracing::info!(
            "{} now owns {range} at epoch {}",
            self.shared.holder,
            token.epoch
        );
        Ok(token)
    }

    /// Give up a range voluntarily.
    ///
    /// Key workers finish their current batch under the still valid
    /// token, then stop. Returns whether the range was owned.
    pub fn release(&self, range: &KeyRange) -> bool {
        let Some(owned) = self.ranges().remove(range) else {
            return false;
        };
        tracing::info!(
            "{} released {range} at epoch {}",
            self.shared.holder,
            owned.token.epoch
        );
        owned.retire();
        self.forget_range(range);
        true
    }

    /// Drop status and committed views of a range.
    fn forget_range(&self, range: &KeyRange) {
        self.shared.status.remove_range(range);
        self.shared.views().retain(|key, _| !range.contains(key));
    }

    /// Give up a range because `token` turned out stale.
    ///
    /// Does nothing if the node has since moved on to another token
    /// for the range.
    fn suspend(&self, token: &OwnershipToken, cause: StoreError) {
        let owned = {
            let mut ranges = self.ranges();
            let current = ranges
                .get(&token.key_range)
                .map_or(false, |owned| owned.token == *token);
            if current {
                ranges.remove(&token.key_range)
            } else {
                None
            }
        };
        let Some(owned) = owned else {
            return;
        };

        tracing::warn!(
            "{} suspending {} at epoch {}: {cause}",
            self.shared.holder,
            token.key_range,
            token.epoch
        );
        owned.retire();
        self.shared
            .status
            .mark_range(&token.key_range, KeyPhase::Suspended);
        self.shared
            .views()
            .retain(|key, _| !token.key_range.contains(key));
        self.shared.report(SupervisorEvent::Suspended {
            token: token.clone(),
            cause,
        });
    }

    /// Stop every key worker immediately, without replying to or
    /// acking anything, and forget all ranges. Nothing is written.
    ///
    /// This is what a process crash looks like from the outside.
    pub fn crash(&self) {
        let ranges = std::mem::take(&mut *self.ranges());
        tracing::warn!("{} crashing with {} ranges", self.shared.holder, ranges.len());
        for owned in ranges.into_values() {
            for worker in owned.workers.values() {
                worker.task.abort();
            }
        }
        self.shared.views().clear();
        self.shared.status.lock().clear();
    }

    fn spawn_worker(
        &self,
        key: &Key,
        token: &OwnershipToken,
        suspended: &Arc<AtomicBool>,
    ) -> WorkerHandle {
        let (tx, rx) = mpsc::channel(self.shared.config.key_queue_capacity);
        let view = self
            .shared
            .views()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(ArcSwapOption::empty()))
            .clone();
        let worker = KeyWorker::new(
            key.clone(),
            token.clone(),
            self.shared.clone(),
            suspended.clone(),
            view,
        );
        WorkerHandle {
            tx,
            task: tokio::spawn(worker.run(rx)),
        }
    }

    /// Process a record.
    ///
    /// Resolves once the record's effects are committed, or it was
    /// found to be a duplicate, or it was rejected. Returns
    /// [`EngineError::Shutdown`] if the key worker went away without
    /// answering, in which case nothing is known about the record and
    /// it must not be acked.
    pub async fn process(&self, record: Record) -> Result<Outcome, EngineError> {
        let metrics = &self.shared.metrics;
        metrics.records_in.add(1, &metrics.labels);

        let key = record.key().clone();
        let (tx, token) = {
            let mut ranges = self.ranges();
            let Some(owned) = ranges
                .values_mut()
                .find(|owned| owned.token.key_range.contains(&key))
            else {
                tracing::trace!("Rejecting {} for unowned key {key}", record.id());
                return Ok(Outcome::Rejected(Rejection::NotOwned));
            };
            let worker = owned
                .workers
                .entry(key.clone())
                .or_insert_with(|| self.spawn_worker(&key, &owned.token, &owned.suspended));
            (worker.tx.clone(), owned.token.clone())
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if tx.send(Msg::new(record, reply_tx)).await.is_err() {
            // The worker stopped since we looked it up.
            let rejection = match self.shared.status.get(&key) {
                Some(KeyStatus {
                    phase: KeyPhase::Halted,
                    ..
                }) => Rejection::Corrupt,
                _ => Rejection::Suspended,
            };
            return Ok(Outcome::Rejected(rejection));
        }
        match reply_rx.await {
            Ok(Reply::Done(outcome)) => Ok(outcome),
            Ok(Reply::Fenced(cause)) => {
                self.suspend(&token, cause);
                Ok(Outcome::Rejected(Rejection::Suspended))
            }
            Err(_) => Err(EngineError::Shutdown),
        }
    }

    /// Replace a halted key's corrupt checkpoint with its newest
    /// intact older one, losing everything committed since.
    ///
    /// The key restarts from the restored state with its next record.
    pub async fn fallback(&self, key: &Key, ack: DataLossAck) -> Result<StoredKey, EngineError> {
        let token = {
            let mut ranges = self.ranges();
            let owned = ranges
                .values_mut()
                .find(|owned| owned.token.key_range.contains(key))
                .ok_or_else(|| EngineError::NotOwned(key.clone()))?;
            if let Some(worker) = owned.workers.remove(key) {
                worker.task.abort();
            }
            owned.token.clone()
        };

        let store = self.shared.store.clone();
        let restored = {
            let key = key.clone();
            blocking(move || store.fallback(&key, &token, &ack)).await?
        };
        if let Some(view) = self.shared.views().get(key) {
            view.store(Some(Arc::new(CommittedView::from_stored(&restored))));
        }
        self.shared.status.lock().remove(key);
        Ok(restored)
    }

    /// The token this node holds for a range, if any.
    pub fn token(&self, range: &KeyRange) -> Option<OwnershipToken> {
        self.ranges().get(range).map(|owned| owned.token.clone())
    }

    pub fn phase(&self, key: &Key) -> Option<KeyPhase> {
        self.shared.status.get(key).map(|status| status.phase)
    }

    /// Lock-free reader of a key's committed state, once the key has
    /// a worker.
    pub fn reader(&self, key: &Key) -> Option<CommittedReader> {
        self.shared.views().get(key).cloned().map(CommittedReader)
    }

    /// The key's committed state, if it has a worker.
    pub fn committed(&self, key: &Key) -> Option<Arc<CommittedView>> {
        self.reader(key).and_then(|reader| reader.load())
    }

    pub fn dedup_stats(&self) -> crate::dedup::DedupStats {
        self.shared.dedup.stats()
    }
}

impl<L: Logic> StatusSource for ComputationNode<L> {
    fn status(&self) -> NodeStatus {
        let ranges = self
            .ranges()
            .values()
            .map(|owned| RangeStatus {
                range: owned.token.key_range.to_string(),
                epoch: owned.token.epoch,
            })
            .collect();
        let keys = self
            .shared
            .status
            .snapshot()
            .into_iter()
            .map(|(key, status)| KeyStatusEntry {
                key: key.to_string(),
                status,
            })
            .collect();
        NodeStatus {
            holder: self.shared.holder.clone(),
            ranges,
            keys,
        }
    }
}

/// A node receives records straight from a [`Sender`] and acks them
/// once processed.
impl<L: Logic> Transport for ComputationNode<L> {
    fn deliver(&self, record: Record, attempt: u32, ack: AckHandle) {
        let node = self.clone();
        tokio::spawn(async move {
            let record_id = record.id();
            match node.process(record).await {
                Ok(outcome) if outcome.should_ack() => {
                    ack.ack(&record_id);
                }
                Ok(outcome) => {
                    tracing::debug!("Not acking {record_id} (attempt {attempt}): {outcome:?}")
                }
                Err(err) => tracing::debug!("Not acking {record_id} (attempt {attempt}): {err}"),
            }
        });
    }
}

#[test]
fn retired_worker_cannot_overwrite_newer_status() {
    let table = StatusTable::default();
    let key = Key::from("x");
    let status = |phase, epoch| KeyStatus {
        phase,
        epoch: Epoch(epoch),
        seq: SequenceNumber(1),
    };

    table.set(&key, status(KeyPhase::Idle, 2));
    // The worker of the previous epoch finds out it was fenced.
    table.set(&key, status(KeyPhase::Suspended, 1));
    assert_eq!(table.get(&key), Some(status(KeyPhase::Idle, 2)));

    table.set(&key, status(KeyPhase::Committing, 2));
    assert_eq!(table.get(&key), Some(status(KeyPhase::Committing, 2)));
    table.set(&key, status(KeyPhase::Processing, 3));
    assert_eq!(table.get(&key), Some(status(KeyPhase::Processing, 3)));
}
