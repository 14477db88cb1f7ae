//! Per-key task running the commit protocol.

use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use chrono::DateTime;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::*;
use crate::checkpoint::Batch;
use crate::checkpoint::PurgeSchedule;
use crate::dedup::Verdict;
use crate::errors::StaleWriter;
use crate::fencing::Validity;
use crate::store::Checkpoint;
use crate::store::Committed;
use crate::with_timer;

pub(crate) struct Msg {
    record: Record,
    reply: oneshot::Sender<Reply>,
}

impl Msg {
    pub(crate) fn new(record: Record, reply: oneshot::Sender<Reply>) -> Self {
        Self { record, reply }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Done(Outcome),
    /// The worker's token is stale. The node suspends the range.
    Fenced(StoreError),
}

/// Why a worker stopped for good.
enum Stop {
    Fenced(StoreError),
    Corrupt(CorruptCheckpoint),
}

/// Split store errors into ones that end the worker and ones worth
/// waiting out.
fn classify(err: StoreError) -> Result<StoreError, Stop> {
    match err {
        StoreError::StaleWriter(_) | StoreError::SequenceConflict { .. } => Err(Stop::Fenced(err)),
        StoreError::Corrupt(corrupt) => Err(Stop::Corrupt(corrupt)),
        err => Ok(err),
    }
}

struct Waiter {
    reply: oneshot::Sender<Reply>,
    /// Redelivery of a record already in the batch.
    duplicate: bool,
}

pub(crate) struct KeyWorker<L: Logic> {
    key: Key,
    token: OwnershipToken,
    shared: Arc<Shared<L>>,
    suspended: Arc<AtomicBool>,
    view: Arc<ArcSwapOption<CommittedView>>,
    /// State including records not yet committed.
    soft: Option<L::State>,
    seq: SequenceNumber,
    batch: Batch<Waiter>,
    purge: PurgeSchedule,
    /// Commit times of the key's retained dedup entries, oldest first.
    retained: VecDeque<DateTime<Utc>>,
}

impl<L: Logic> KeyWorker<L> {
    pub(crate) fn new(
        key: Key,
        token: OwnershipToken,
        shared: Arc<Shared<L>>,
        suspended: Arc<AtomicBool>,
        view: Arc<ArcSwapOption<CommittedView>>,
    ) -> Self {
        Self {
            key,
            token,
            shared,
            suspended,
            view,
            soft: None,
            seq: SequenceNumber::default(),
            batch: Batch::default(),
            purge: PurgeSchedule::default(),
            retained: VecDeque::new(),
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<Msg>) {
        tracing::debug!("Starting worker for key {} at epoch {}", self.key, self.token.epoch);
        let res = match self.start().await {
            Ok(()) => self.serve(&mut rx).await,
            Err(stop) => Err(stop),
        };
        if let Err(stop) = res {
            self.stop(stop, &mut rx);
        }
        tracing::debug!("Worker for key {} stopped", self.key);
    }

    fn set_phase(&self, phase: KeyPhase) {
        // A released range's keys are gone from the table; don't bring
        // them back while finishing up.
        if self.suspended.load(Ordering::SeqCst)
            && !matches!(phase, KeyPhase::Suspended | KeyPhase::Halted)
        {
            return;
        }
        self.shared.status.set(
            &self.key,
            KeyStatus {
                phase,
                epoch: self.token.epoch,
                seq: self.seq,
            },
        );
    }

    /// Load the key's last checkpoint and pick up where it left off.
    async fn start(&mut self) -> Result<(), Stop> {
        self.set_phase(KeyPhase::Processing);
        let stored = {
            let store = self.shared.store.clone();
            let key = self.key.clone();
            self.persist(move || store.load(&key)).await?
        };

        let view = match stored {
            Some(stored) => {
                if stored.token_epoch > self.token.epoch {
                    return Err(Stop::Fenced(
                        StaleWriter {
                            range: self.token.key_range.clone(),
                            attempted: self.token.epoch,
                            current: stored.token_epoch,
                        }
                        .into(),
                    ));
                }
                self.soft = stored
                    .hard_state
                    .as_ref()
                    .map(|bytes| bytes.de::<L::State>())
                    .transpose()
                    .map_err(|err| {
                        Stop::Corrupt(CorruptCheckpoint {
                            key: self.key.clone(),
                            seq: stored.sequence_number,
                            detail: format!("hard state does not decode: {err}"),
                        })
                    })?;
                self.seq = stored.sequence_number;

                // The last commit may not have reached downstream.
                let view = CommittedView::from_stored(&stored);
                self.emit(stored.productions).await;
                view
            }
            None => CommittedView {
                seq: SequenceNumber::default(),
                dedup_cursor: DedupCursor::default(),
                epoch: Epoch::UNOWNED,
                hard_state: None,
            },
        };
        self.view.store(Some(Arc::new(view)));

        let entries = {
            let store = self.shared.store.clone();
            let key = self.key.clone();
            self.persist(move || store.dedup_scan(&key)).await?
        };
        tracing::trace!("Warming dedup of key {} with {} entries", self.key, entries.len());
        self.shared.dedup.warm(&entries);
        let mut retained: Vec<_> = entries.iter().map(|entry| entry.committed_at).collect();
        retained.sort();
        retained.dedup();
        self.retained = retained.into();

        self.set_phase(KeyPhase::Idle);
        Ok(())
    }

    async fn serve(&mut self, rx: &mut mpsc::Receiver<Msg>) -> Result<(), Stop> {
        loop {
            let deadline = self.shared.coordinator.deadline(&self.batch);
            let sweep = self.sweep_at();
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle(msg).await?,
                    None => {
                        // Retired. Anything open is committed under the
                        // old token, or fenced if that is stale.
                        self.commit().await?;
                        return Ok(());
                    }
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.commit().await?;
                }
                _ = tokio::time::sleep_until(sweep.unwrap_or_else(Instant::now)), if sweep.is_some() => {
                    self.sweep().await?;
                }
            }
        }
    }

    async fn handle(&mut self, msg: Msg) -> Result<(), Stop> {
        let Msg { record, reply } = msg;
        if self.suspended.load(Ordering::SeqCst) {
            let _ = reply.send(Reply::Done(Outcome::Rejected(Rejection::Suspended)));
            return Ok(());
        }
        self.set_phase(KeyPhase::Processing);

        let validity = {
            let fencing = self.shared.fencing.clone();
            let token = self.token.clone();
            self.persist(move || fencing.validate(&token)).await?
        };
        if let Validity::Stale { current } = validity {
            let err = StoreError::from(StaleWriter {
                range: self.token.key_range.clone(),
                attempted: self.token.epoch,
                current,
            });
            let _ = reply.send(Reply::Fenced(err.clone()));
            return Err(Stop::Fenced(err));
        }

        let record_id = record.id();
        if self.batch.contains(&record_id) {
            tracing::trace!("{record_id} is already waiting in the batch of key {}", self.key);
            self.batch.wait(Waiter {
                reply,
                duplicate: true,
            });
            return Ok(());
        }

        let verdict = {
            let shared = self.shared.clone();
            let key = self.key.clone();
            self.persist(move || shared.dedup.check_and_mark(&key, &record_id))
                .await?
        };
        if verdict == Verdict::Duplicate {
            let metrics = &self.shared.metrics;
            metrics.duplicates.add(1, &metrics.labels);
            tracing::trace!("Dropping duplicate {record_id} for key {}", self.key);
            let _ = reply.send(Reply::Done(Outcome::Duplicate));
            self.set_phase(KeyPhase::Idle);
            return Ok(());
        }

        let metrics = &self.shared.metrics;
        let applied = with_timer!(
            metrics.logic_duration,
            metrics.labels,
            self.shared.logic.apply(self.soft.as_ref(), &record)
        );
        let applied = match applied {
            Ok(applied) => applied,
            Err(err) => {
                tracing::warn!("Processing {record_id} for key {} failed: {err}", self.key);
                let _ = reply.send(Reply::Done(Outcome::Failed(err)));
                self.set_phase(KeyPhase::Idle);
                return Ok(());
            }
        };

        let productions = applied
            .emit
            .into_iter()
            .enumerate()
            .map(|(index, emit)| {
                Record::with_id(
                    record_id.derive(index),
                    emit.key,
                    emit.payload,
                    record.produced_at(),
                )
            })
            .collect();
        self.soft = applied.state;
        self.batch.push(
            record_id,
            productions,
            Waiter {
                reply,
                duplicate: false,
            },
        );

        if self.shared.coordinator.must_commit(&self.batch) {
            self.commit().await
        } else {
            self.set_phase(KeyPhase::Idle);
            Ok(())
        }
    }

    /// Checkpoint the open batch, then release its effects.
    async fn commit(&mut self) -> Result<(), Stop> {
        if self.batch.is_empty() {
            return Ok(());
        }
        self.set_phase(KeyPhase::Committing);

        let hard_state = match self.soft.as_ref().map(StateBytes::ser).transpose() {
            Ok(hard_state) => hard_state,
            Err(err) => {
                self.abandon(&err.to_string());
                return Ok(());
            }
        };
        let committed_at = Utc::now();
        let ckpt = Checkpoint {
            key: self.key.clone(),
            hard_state,
            dedup_append: self.batch.ids().to_vec(),
            purge_before: self
                .shared
                .coordinator
                .purge_before(&mut self.purge, committed_at),
            productions: self.batch.productions().to_vec(),
            token: self.token.clone(),
            expected_seq: self.seq,
            committed_at,
        };

        let committed = self.write(&ckpt).await?;
        self.shared
            .dedup
            .mark_committed(&self.key, &ckpt.dedup_append);
        self.applied(&ckpt, committed);
        self.emit(ckpt.productions).await;
        for waiter in self.batch.take_waiters() {
            let outcome = if waiter.duplicate {
                Outcome::Duplicate
            } else {
                Outcome::Committed(committed.seq)
            };
            let _ = waiter.reply.send(Reply::Done(outcome));
        }
        tracing::trace!("Committed key {} at {}", self.key, committed.seq);
        self.set_phase(KeyPhase::Idle);
        Ok(())
    }

    /// Write a checkpoint until it commits or the worker has to stop.
    async fn write(&self, ckpt: &Checkpoint) -> Result<Committed, Stop> {
        let metrics = &self.shared.metrics;
        loop {
            let res = with_timer!(
                metrics.checkpoint_duration,
                metrics.labels,
                self.shared.coordinator.commit(ckpt.clone(), metrics).await
            );
            match res {
                Ok(committed) => return Ok(committed),
                Err(err) => match classify(err) {
                    Ok(err) => self.stall(err).await,
                    Err(stop) => {
                        if let Stop::Fenced(_) = stop {
                            metrics.stale_rejections.add(1, &metrics.labels);
                        }
                        return Err(stop);
                    }
                },
            }
        }
    }

    /// Catch up with a checkpoint that just committed.
    fn applied(&mut self, ckpt: &Checkpoint, committed: Committed) {
        let metrics = &self.shared.metrics;
        self.seq = committed.seq;
        metrics.commits.add(1, &metrics.labels);
        if let Some(cutoff) = ckpt.purge_before {
            while self.retained.front().map_or(false, |at| *at < cutoff) {
                self.retained.pop_front();
            }
        }
        if committed.purged > 0 {
            tracing::debug!("Purged {} dedup entries of key {}", committed.purged, self.key);
        }
        if !ckpt.dedup_append.is_empty() {
            self.retained.push_back(ckpt.committed_at);
        }
        self.view.store(Some(Arc::new(CommittedView {
            seq: committed.seq,
            dedup_cursor: committed.dedup_cursor,
            epoch: self.token.epoch,
            hard_state: ckpt.hard_state.clone(),
        })));
    }

    /// When an idle key has expired dedup entries to purge.
    fn sweep_at(&self) -> Option<Instant> {
        if !self.batch.is_empty() {
            return None;
        }
        let oldest = *self.retained.front()?;
        self.shared.coordinator.sweep_at(&self.purge, oldest)
    }

    /// Purge expired dedup entries of an idle key with a checkpoint of
    /// its unchanged state.
    async fn sweep(&mut self) -> Result<(), Stop> {
        let committed_at = Utc::now();
        let Some(purge_before) = self
            .shared
            .coordinator
            .purge_before(&mut self.purge, committed_at)
        else {
            return Ok(());
        };
        if !self.retained.front().map_or(false, |at| *at < purge_before) {
            return Ok(());
        }
        self.set_phase(KeyPhase::Committing);

        // Productions of the last checkpoint were handed downstream
        // before the worker took anything else.
        let ckpt = Checkpoint {
            key: self.key.clone(),
            hard_state: self.view.load_full().and_then(|view| view.hard_state.clone()),
            dedup_append: Vec::new(),
            purge_before: Some(purge_before),
            productions: Vec::new(),
            token: self.token.clone(),
            expected_seq: self.seq,
            committed_at,
        };
        let committed = self.write(&ckpt).await?;
        self.applied(&ckpt, committed);
        tracing::trace!("Swept idle key {} at {}", self.key, committed.seq);
        self.set_phase(KeyPhase::Idle);
        Ok(())
    }

    /// Hand committed records downstream, waiting out backpressure.
    ///
    /// Gives up only once the range is retired. The records stay in
    /// the key's last checkpoint, and whoever starts the key next sends
    /// them again.
    async fn emit(&self, records: Vec<Record>) {
        let backoff = &self.shared.config.delivery.backoff;
        let metrics = &self.shared.metrics;
        for record in records {
            let mut attempt = 0;
            while let Err(err) = self.shared.downstream.send(record.clone()) {
                if self.suspended.load(Ordering::SeqCst) {
                    tracing::warn!(
                        "Leaving {} of key {} to its next owner: {err}",
                        record.id(),
                        self.key
                    );
                    return;
                }
                metrics.downstream_backpressure.add(1, &metrics.labels);
                let delay = backoff.delay(attempt);
                tracing::debug!(
                    "Downstream refused {} of key {}: {err}; retry in {delay:?}",
                    record.id(),
                    self.key
                );
                tokio::time::sleep(delay).await;
                attempt = attempt.saturating_add(1);
            }
        }
    }

    /// Drop the open batch without committing it and go back to the
    /// committed state.
    fn abandon(&mut self, reason: &str) {
        tracing::error!(
            "Abandoning batch of {} records for key {}: {reason}",
            self.batch.len(),
            self.key
        );
        for waiter in self.batch.take_waiters() {
            let _ = waiter.reply.send(Reply::Done(Outcome::Failed(LogicError(format!(
                "state of key {} could not be encoded: {reason}",
                self.key
            )))));
        }
        self.soft = self
            .view
            .load_full()
            .and_then(|view| view.state::<L::State>().ok().flatten());
        self.set_phase(KeyPhase::Idle);
    }

    /// Report a store that stays unavailable past the retry budget,
    /// then wait before starting over.
    async fn stall(&self, error: StoreError) {
        let delay = self.shared.config.store_retry.backoff.max;
        tracing::error!("Key {} stalled on {error}; trying again in {delay:?}", self.key);
        self.shared.report(SupervisorEvent::Stalled {
            key: self.key.clone(),
            error,
        });
        tokio::time::sleep(delay).await;
    }

    /// Run a store call until it succeeds or hits a fatal error.
    async fn persist<T, F>(&self, op: F) -> Result<T, Stop>
    where
        T: Send + 'static,
        F: Fn() -> Result<T, StoreError> + Send + Sync + 'static,
    {
        let op = Arc::new(op);
        let retry = &self.shared.config.store_retry;
        loop {
            let res = retry_transient(&retry.backoff, retry.max_attempts, |_| {
                let op = op.clone();
                blocking(move || op())
            })
            .await;
            match res {
                Ok(value) => return Ok(value),
                Err(err) => self.stall(classify(err)?).await,
            }
        }
    }

    /// Fail everything the worker still holds and refuse anything
    /// queued for it.
    fn stop(&mut self, stop: Stop, rx: &mut mpsc::Receiver<Msg>) {
        let reply = match stop {
            Stop::Fenced(err) => {
                tracing::warn!(
                    "Worker for key {} fenced at epoch {}: {err}",
                    self.key,
                    self.token.epoch
                );
                self.set_phase(KeyPhase::Suspended);
                Reply::Fenced(err)
            }
            Stop::Corrupt(corrupt) => {
                tracing::error!("Halting key {}: {corrupt}", self.key);
                self.set_phase(KeyPhase::Halted);
                self.shared.report(SupervisorEvent::Corrupt(corrupt));
                Reply::Done(Outcome::Rejected(Rejection::Corrupt))
            }
        };
        rx.close();
        self.soft = None;
        self.view.store(None);

        for waiter in self.batch.take_waiters() {
            let _ = waiter.reply.send(reply.clone());
        }
        while let Ok(msg) = rx.try_recv() {
            let _ = msg.reply.send(reply.clone());
        }
    }
}
