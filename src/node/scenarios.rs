//! End-to-end behavior of nodes, senders, and stores together.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use super::*;
use crate::config::CheckpointPolicy;
use crate::record::Payload;
use crate::record::RecordId;
use crate::retry::Backoff;
use crate::store::Fault;
use crate::store::InMemStore;
use crate::store::SqliteStore;

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.dedup.bloom_bits = 1 << 16;
    config.store_retry.backoff =
        Backoff::fixed_ratio(Duration::from_millis(1), Duration::from_millis(10), 2.0);
    config.store_retry.max_attempts = 3;
    config.delivery.backoff =
        Backoff::fixed_ratio(Duration::from_millis(100), Duration::from_millis(100), 1.0);
    config.delivery.tick = Duration::from_millis(10);
    config
}

fn with_interval(mut config: EngineConfig, interval: Duration, max_batch: usize) -> EngineConfig {
    config.checkpoint = CheckpointPolicy::Interval {
        interval,
        max_batch,
    };
    config
}

fn count_node<S>(
    name: &str,
    store: &Arc<S>,
    config: EngineConfig,
) -> (
    ComputationNode<CountLogic>,
    mpsc::UnboundedReceiver<SupervisorEvent>,
)
where
    S: StateStore + FencingAuthority + 'static,
{
    ComputationNode::new(
        HolderId::from(name),
        CountLogic,
        store.clone(),
        Arc::new(Discard),
        config,
    )
    .unwrap()
}

fn count_of(store: &dyn StateStore, key: &str) -> Option<u64> {
    store
        .load(&Key::from(key))
        .unwrap()
        .and_then(|stored| stored.hard_state)
        .map(|bytes| bytes.de().unwrap())
}

fn seq_of(store: &dyn StateStore, key: &str) -> SequenceNumber {
    store
        .load(&Key::from(key))
        .unwrap()
        .map(|stored| stored.sequence_number)
        .unwrap_or_default()
}

#[tokio::test]
async fn duplicate_deliveries_commit_once() {
    let store = Arc::new(InMemStore::new());
    let (tx, mut downstream) = mpsc::unbounded_channel();
    let (node, _events) = ComputationNode::new(
        HolderId::from("node1"),
        CountLogic,
        store.clone(),
        Arc::new(tx),
        test_config(),
    )
    .unwrap();
    node.acquire(KeyRange::full()).await.unwrap();

    let record = Record::new("x", "a");
    assert_eq!(
        node.process(record.clone()).await.unwrap(),
        Outcome::Committed(SequenceNumber(1))
    );
    for _ in 0..4 {
        assert_eq!(node.process(record.clone()).await.unwrap(), Outcome::Duplicate);
    }

    assert_eq!(count_of(&*store, "x"), Some(1));
    assert_eq!(seq_of(&*store, "x"), SequenceNumber(1));
    let sent = downstream.recv().await.unwrap();
    assert_eq!(sent.id(), record.id().derive(0));
    assert_eq!(sent.key(), &Key::from("out-x"));
    assert!(downstream.try_recv().is_err());
}

#[tokio::test]
async fn commits_are_ordered_per_key() {
    let store = Arc::new(InMemStore::new());
    let (node, _events) = count_node("node1", &store, test_config());
    node.acquire(KeyRange::full()).await.unwrap();

    let (a, b, c, other) = tokio::join!(
        node.process(Record::new("x", "a")),
        node.process(Record::new("x", "b")),
        node.process(Record::new("x", "c")),
        node.process(Record::new("y", "a")),
    );
    let mut seqs: Vec<_> = [a, b, c]
        .into_iter()
        .map(|outcome| match outcome.unwrap() {
            Outcome::Committed(seq) => seq.0,
            outcome => panic!("expected a commit, got {outcome:?}"),
        })
        .collect();
    seqs.sort();
    assert_eq!(seqs, vec![1, 2, 3]);
    assert_eq!(other.unwrap(), Outcome::Committed(SequenceNumber(1)));

    assert_eq!(count_of(&*store, "x"), Some(3));
    assert_eq!(count_of(&*store, "y"), Some(1));
}

#[tokio::test]
async fn zombie_cannot_commit() {
    let store = Arc::new(InMemStore::new());
    let range = KeyRange::between("a", "z");
    let (node1, mut events1) = count_node("node1", &store, test_config());
    let (node2, _events2) = count_node("node2", &store, test_config());

    let token1 = node1.acquire(range.clone()).await.unwrap();
    assert_eq!(token1.epoch, Epoch(1));
    assert_eq!(
        node1.process(Record::new("cat", "a")).await.unwrap(),
        Outcome::Committed(SequenceNumber(1))
    );

    // node1 is presumed dead and its range handed to node2, but it
    // keeps running.
    let token2 = node2.acquire(range.clone()).await.unwrap();
    assert_eq!(token2.epoch, Epoch(2));

    let record = Record::new("cat", "b");
    assert_eq!(
        node1.process(record.clone()).await.unwrap(),
        Outcome::Rejected(Rejection::Suspended)
    );
    match events1.recv().await.unwrap() {
        SupervisorEvent::Suspended { token, cause } => {
            assert_eq!(token, token1);
            assert!(
                matches!(cause, StoreError::StaleWriter(ref stale) if stale.current == Epoch(2)),
                "{cause:?}"
            );
        }
        event => panic!("expected suspension, got {event:?}"),
    }
    assert_eq!(node1.token(&range), None);
    assert_eq!(node1.phase(&Key::from("cat")), Some(KeyPhase::Suspended));
    assert_eq!(count_of(&*store, "cat"), Some(1));

    // The zombie no longer owns anything.
    assert_eq!(
        node1.process(record.clone()).await.unwrap(),
        Outcome::Rejected(Rejection::NotOwned)
    );

    assert_eq!(
        node2.process(record).await.unwrap(),
        Outcome::Committed(SequenceNumber(2))
    );
    assert_eq!(count_of(&*store, "cat"), Some(2));
    assert_eq!(
        store.load(&Key::from("cat")).unwrap().unwrap().token_epoch,
        Epoch(2)
    );
    assert_eq!(
        node2.process(Record::new("zebra", "a")).await.unwrap(),
        Outcome::Rejected(Rejection::NotOwned)
    );
}

#[tokio::test(start_paused = true)]
async fn takeover_fences_an_open_batch() {
    let store = Arc::new(InMemStore::new());
    let range = KeyRange::between("a", "z");
    let config = with_interval(test_config(), Duration::from_secs(1), 100);
    let (node1, mut events1) = count_node("node1", &store, config.clone());
    let (node2, _events2) = count_node("node2", &store, config);
    node1.acquire(range.clone()).await.unwrap();

    let record = Record::new("cat", "a");
    let pending = tokio::spawn({
        let node1 = node1.clone();
        let record = record.clone();
        async move { node1.process(record).await }
    });
    // Processed, waiting in the batch.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.load(&Key::from("cat")).unwrap(), None);

    node2.acquire(range).await.unwrap();
    assert_eq!(
        pending.await.unwrap().unwrap(),
        Outcome::Rejected(Rejection::Suspended)
    );
    assert!(matches!(
        events1.recv().await.unwrap(),
        SupervisorEvent::Suspended { .. }
    ));
    assert_eq!(store.load(&Key::from("cat")).unwrap(), None);

    let start = Instant::now();
    let outcome = node2.process(record).await.unwrap();
    assert_eq!(outcome, Outcome::Committed(SequenceNumber(1)));
    assert!(start.elapsed() >= Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn reacquired_range_reports_the_new_epoch() {
    let store = Arc::new(InMemStore::new());
    let config = with_interval(test_config(), Duration::from_secs(1), 100);
    let (node, _events) = count_node("node1", &store, config);
    node.acquire(KeyRange::full()).await.unwrap();

    let pending = tokio::spawn({
        let node = node.clone();
        async move { node.process(Record::new("x", "a")).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The retired worker's open batch is fenced by the new token.
    let token = node.acquire(KeyRange::full()).await.unwrap();
    assert_eq!(token.epoch, Epoch(2));
    assert_eq!(
        node.process(Record::new("x", "b")).await.unwrap(),
        Outcome::Committed(SequenceNumber(1))
    );
    assert_eq!(
        pending.await.unwrap().unwrap(),
        Outcome::Rejected(Rejection::Suspended)
    );

    let status = node.status();
    assert_eq!(status.keys.len(), 1);
    assert_eq!(status.keys[0].status.phase, KeyPhase::Idle);
    assert_eq!(status.keys[0].status.epoch, Epoch(2));
    assert_eq!(node.token(&KeyRange::full()), Some(token));
    assert_eq!(count_of(&*store, "x"), Some(1));
}

#[tokio::test(start_paused = true)]
async fn crash_before_commit_changes_nothing() {
    let store = Arc::new(InMemStore::new());
    let (node1, mut events) = count_node("node1", &store, test_config());
    node1.acquire(KeyRange::full()).await.unwrap();

    let first = Record::new("x", "a");
    assert_eq!(
        node1.process(first.clone()).await.unwrap(),
        Outcome::Committed(SequenceNumber(1))
    );

    store.inject(Fault::Unavailable(u32::MAX));
    let second = Record::new("x", "b");
    let in_flight = tokio::spawn({
        let node1 = node1.clone();
        let second = second.clone();
        async move { node1.process(second).await }
    });
    let stalled = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(
        matches!(stalled, SupervisorEvent::Stalled { ref key, .. } if *key == Key::from("x")),
        "{stalled:?}"
    );
    assert_eq!(node1.phase(&Key::from("x")), Some(KeyPhase::Committing));

    node1.crash();
    assert!(matches!(
        in_flight.await.unwrap(),
        Err(EngineError::Shutdown)
    ));
    store.clear_faults();
    assert_eq!(count_of(&*store, "x"), Some(1));
    assert_eq!(seq_of(&*store, "x"), SequenceNumber(1));

    let (node2, _events2) = count_node("node2", &store, test_config());
    node2.acquire(KeyRange::full()).await.unwrap();
    assert_eq!(
        node2.process(second).await.unwrap(),
        Outcome::Committed(SequenceNumber(2))
    );
    assert_eq!(node2.process(first).await.unwrap(), Outcome::Duplicate);
    assert_eq!(count_of(&*store, "x"), Some(2));
}

/// Processes the first delivery but loses its ack.
struct FirstAckLost {
    node: ComputationNode<CountLogic>,
    lost: AtomicBool,
}

impl Transport for FirstAckLost {
    fn deliver(&self, record: Record, attempt: u32, ack: AckHandle) {
        if self.lost.swap(true, Ordering::SeqCst) {
            self.node.deliver(record, attempt, ack);
        } else {
            let node = self.node.clone();
            tokio::spawn(async move {
                let _ = node.process(record).await;
            });
        }
    }
}

#[tokio::test(start_paused = true)]
async fn lost_ack_is_redelivered_and_deduped() {
    let store = Arc::new(InMemStore::new());
    let config = test_config();
    let (node, _events) = count_node("node1", &store, config.clone());
    node.acquire(KeyRange::full()).await.unwrap();

    let transport = Arc::new(FirstAckLost {
        node: node.clone(),
        lost: AtomicBool::new(false),
    });
    let (sender, mut failures) = Sender::start("upstream", &config.delivery, transport);
    let record = Record::new("x", "a");
    sender.submit(record.clone()).unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(sender.outstanding(), 0);
    assert!(failures.try_recv().is_err());
    assert_eq!(count_of(&*store, "x"), Some(1));
    assert_eq!(seq_of(&*store, "x"), SequenceNumber(1));
    assert!(node.dedup_stats().duplicates >= 1);
}

#[tokio::test(start_paused = true)]
async fn node_acks_a_sender_directly() {
    let store = Arc::new(InMemStore::new());
    let config = test_config();
    let (node, _events) = count_node("node1", &store, config.clone());
    node.acquire(KeyRange::full()).await.unwrap();

    let (sender, _failures) = Sender::start("upstream", &config.delivery, Arc::new(node.clone()));
    for payload in ["a", "b", "c"] {
        sender.submit(Record::new("x", payload)).unwrap();
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(sender.outstanding(), 0);
    assert_eq!(count_of(&*store, "x"), Some(3));
}

/// Consumes deliveries, acking each on its given attempt if any.
struct SlowConsumer {
    received: std::sync::Mutex<Vec<(RecordId, u32)>>,
    ack_on_attempt: Option<u32>,
}

impl SlowConsumer {
    fn new(ack_on_attempt: Option<u32>) -> Self {
        Self {
            received: Default::default(),
            ack_on_attempt,
        }
    }

    fn received(&self, record_id: RecordId) -> bool {
        self.received
            .lock()
            .unwrap()
            .iter()
            .any(|(id, _)| *id == record_id)
    }
}

impl Transport for SlowConsumer {
    fn deliver(&self, record: Record, attempt: u32, ack: AckHandle) {
        self.received.lock().unwrap().push((record.id(), attempt));
        if self.ack_on_attempt == Some(attempt) {
            ack.ack(&record.id());
        }
    }
}

/// A node sending its productions through a [`Sender`] that only has
/// room for one unacked record.
fn chained_node(
    store: &Arc<InMemStore>,
    consumer: Arc<SlowConsumer>,
) -> (ComputationNode<CountLogic>, Arc<Sender>) {
    let config = test_config();
    let mut delivery = config.delivery.clone();
    delivery.max_outstanding = 1;
    let (downstream, _failures) = Sender::start("downstream", &delivery, consumer);
    let downstream = Arc::new(downstream);
    let (node, _events) = ComputationNode::new(
        HolderId::from("node1"),
        CountLogic,
        store.clone(),
        downstream.clone(),
        config,
    )
    .unwrap();
    (node, downstream)
}

#[tokio::test(start_paused = true)]
async fn backpressured_downstream_holds_back_the_ack() {
    let store = Arc::new(InMemStore::new());
    let consumer = Arc::new(SlowConsumer::new(Some(2)));
    let (node, downstream) = chained_node(&store, consumer.clone());
    node.acquire(KeyRange::full()).await.unwrap();

    let (a, b) = (Record::new("x", "a"), Record::new("x", "b"));
    assert_eq!(
        node.process(a.clone()).await.unwrap(),
        Outcome::Committed(SequenceNumber(1))
    );
    assert!(downstream.is_pending(&a.id().derive(0)));

    let mut pending = tokio::spawn({
        let node = node.clone();
        let b = b.clone();
        async move { node.process(b).await }
    });
    // b commits, but its production doesn't fit downstream until a's
    // is acked, so neither is b.
    assert!(tokio::time::timeout(Duration::from_millis(50), &mut pending)
        .await
        .is_err());
    assert_eq!(seq_of(&*store, "x"), SequenceNumber(2));
    assert!(consumer.received(a.id().derive(0)));
    assert!(!consumer.received(b.id().derive(0)));

    assert_eq!(
        pending.await.unwrap().unwrap(),
        Outcome::Committed(SequenceNumber(2))
    );
    assert!(consumer.received(b.id().derive(0)));
}

#[tokio::test(start_paused = true)]
async fn unacked_downstream_still_gets_every_production() {
    let store = Arc::new(InMemStore::new());
    // Never acks; slots only free up as deliveries run out of
    // attempts.
    let consumer = Arc::new(SlowConsumer::new(None));
    let (node, _downstream) = chained_node(&store, consumer.clone());
    node.acquire(KeyRange::full()).await.unwrap();

    let records: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|payload| Record::new("x", payload))
        .collect();
    for (i, record) in records.iter().enumerate() {
        assert_eq!(
            node.process(record.clone()).await.unwrap(),
            Outcome::Committed(SequenceNumber(i as u64 + 1))
        );
    }
    for record in &records {
        assert!(consumer.received(record.id().derive(0)));
    }
}

#[tokio::test]
async fn fast_layer_false_positives_never_drop_records() {
    let store = Arc::new(InMemStore::new());
    let (node, _events) = ComputationNode::from_parts(
        HolderId::from("node1"),
        CountLogic,
        store.clone(),
        store.clone(),
        Arc::new(PassthroughLayer),
        Arc::new(Discard),
        test_config(),
    )
    .unwrap();
    node.acquire(KeyRange::full()).await.unwrap();

    let records: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|payload| Record::new("x", payload))
        .collect();
    for (i, record) in records.iter().enumerate() {
        assert_eq!(
            node.process(record.clone()).await.unwrap(),
            Outcome::Committed(SequenceNumber(i as u64 + 1))
        );
    }
    let stats = node.dedup_stats();
    assert_eq!(stats.durable_lookups, 3);
    assert_eq!(stats.false_positives, 3);

    assert_eq!(
        node.process(records[0].clone()).await.unwrap(),
        Outcome::Duplicate
    );
    assert_eq!(node.dedup_stats().duplicates, 1);
    assert_eq!(count_of(&*store, "x"), Some(3));
}

#[tokio::test(start_paused = true)]
async fn interval_batches_ack_after_commit() {
    let store = Arc::new(InMemStore::new());
    let config = with_interval(test_config(), Duration::from_secs(10), 3);
    let (node, _events) = count_node("node1", &store, config);
    node.acquire(KeyRange::full()).await.unwrap();

    let (first, second) = (Record::new("x", "a"), Record::new("x", "b"));
    let start = Instant::now();
    let (a, b, c) = tokio::join!(
        node.process(first.clone()),
        node.process(second),
        node.process(first),
    );
    assert!(start.elapsed() >= Duration::from_secs(10));
    let outcomes = [a.unwrap(), b.unwrap(), c.unwrap()];
    assert_eq!(
        outcomes
            .iter()
            .filter(|outcome| **outcome == Outcome::Committed(SequenceNumber(1)))
            .count(),
        2
    );
    assert_eq!(
        outcomes
            .iter()
            .filter(|outcome| **outcome == Outcome::Duplicate)
            .count(),
        1
    );
    let stored = store.load(&Key::from("x")).unwrap().unwrap();
    assert_eq!(stored.sequence_number, SequenceNumber(1));
    assert_eq!(stored.dedup_cursor, DedupCursor(2));

    // A full batch doesn't wait for the interval.
    let start = Instant::now();
    let (a, b, c) = tokio::join!(
        node.process(Record::new("x", "c")),
        node.process(Record::new("x", "d")),
        node.process(Record::new("x", "e")),
    );
    assert!(start.elapsed() < Duration::from_secs(10));
    for outcome in [a, b, c] {
        assert_eq!(outcome.unwrap(), Outcome::Committed(SequenceNumber(2)));
    }
    assert_eq!(count_of(&*store, "x"), Some(5));
}

#[tokio::test(start_paused = true)]
async fn long_retention_survives_ownership_churn() {
    let store = Arc::new(InMemStore::new());
    let config = with_interval(test_config(), Duration::from_millis(100), 10);
    let (node1, _events1) = count_node("node1", &store, config.clone());
    let (node2, _events2) = count_node("node2", &store, config);
    node1.acquire(KeyRange::full()).await.unwrap();

    let records: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|payload| Record::new("x", payload))
        .collect();
    let (a, b, c) = tokio::join!(
        node1.process(records[0].clone()),
        node1.process(records[1].clone()),
        node1.process(records[2].clone()),
    );
    for outcome in [a, b, c] {
        assert_eq!(outcome.unwrap(), Outcome::Committed(SequenceNumber(1)));
    }

    node2.acquire(KeyRange::full()).await.unwrap();
    for record in &records {
        assert_eq!(node2.process(record.clone()).await.unwrap(), Outcome::Duplicate);
    }

    node1.acquire(KeyRange::full()).await.unwrap();
    for record in &records {
        assert_eq!(node1.process(record.clone()).await.unwrap(), Outcome::Duplicate);
    }
    assert_eq!(
        node1.process(Record::new("x", "d")).await.unwrap(),
        Outcome::Committed(SequenceNumber(2))
    );
    assert_eq!(count_of(&*store, "x"), Some(4));
}

#[tokio::test]
async fn redelivery_after_retention_is_processed_again() {
    let store = Arc::new(InMemStore::new());
    let mut config = test_config();
    config.dedup.retention = Duration::ZERO;
    config.dedup.purge_interval = Duration::ZERO;
    let (node1, _events1) = count_node("node1", &store, config.clone());
    node1.acquire(KeyRange::full()).await.unwrap();

    let (first, second) = (Record::new("x", "a"), Record::new("x", "b"));
    node1.process(first.clone()).await.unwrap();
    node1.process(second.clone()).await.unwrap();
    let retained: Vec<_> = store
        .dedup_scan(&Key::from("x"))
        .unwrap()
        .into_iter()
        .map(|entry| entry.record_id)
        .collect();
    assert_eq!(retained, vec![second.id()]);

    node1.crash();
    let (node2, _events2) = count_node("node2", &store, config);
    node2.acquire(KeyRange::full()).await.unwrap();
    assert_eq!(
        node2.process(first).await.unwrap(),
        Outcome::Committed(SequenceNumber(3))
    );
    assert_eq!(count_of(&*store, "x"), Some(3));
}

#[tokio::test]
async fn idle_keys_purge_expired_dedup_entries() {
    let store = Arc::new(InMemStore::new());
    let mut config = test_config();
    config.dedup.retention = Duration::from_millis(200);
    config.dedup.purge_interval = Duration::ZERO;
    let (node, _events) = count_node("node1", &store, config);
    node.acquire(KeyRange::full()).await.unwrap();

    let key = Key::from("x");
    assert_eq!(
        node.process(Record::new("x", "a")).await.unwrap(),
        Outcome::Committed(SequenceNumber(1))
    );
    assert_eq!(store.dedup_scan(&key).unwrap().len(), 1);

    // No further records arrive for the key.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(store.dedup_scan(&key).unwrap().is_empty());
    // Purged by a checkpoint of the unchanged state.
    assert_eq!(seq_of(&*store, "x"), SequenceNumber(2));
    assert_eq!(count_of(&*store, "x"), Some(1));
    assert_eq!(node.committed(&key).unwrap().seq, SequenceNumber(2));
    assert_eq!(node.phase(&key), Some(KeyPhase::Idle));

    assert_eq!(
        node.process(Record::new("x", "b")).await.unwrap(),
        Outcome::Committed(SequenceNumber(3))
    );
    assert_eq!(count_of(&*store, "x"), Some(2));
}

#[tokio::test]
async fn productions_are_resent_on_restart() {
    let store = Arc::new(InMemStore::new());
    let (tx1, mut out1) = mpsc::unbounded_channel();
    let (node1, _events1) = ComputationNode::new(
        HolderId::from("node1"),
        CountLogic,
        store.clone(),
        Arc::new(tx1),
        test_config(),
    )
    .unwrap();
    node1.acquire(KeyRange::full()).await.unwrap();

    let first = Record::new("x", "a");
    node1.process(first.clone()).await.unwrap();
    assert_eq!(out1.recv().await.unwrap().id(), first.id().derive(0));
    node1.crash();

    let (tx2, mut out2) = mpsc::unbounded_channel();
    let (node2, _events2) = ComputationNode::new(
        HolderId::from("node2"),
        CountLogic,
        store.clone(),
        Arc::new(tx2),
        test_config(),
    )
    .unwrap();
    node2.acquire(KeyRange::full()).await.unwrap();
    let second = Record::new("x", "b");
    node2.process(second.clone()).await.unwrap();

    // Downstream dedups the repeat by its ID.
    let resent = out2.recv().await.unwrap();
    assert_eq!(resent.id(), first.id().derive(0));
    assert_eq!(resent.payload(), &Payload::from("a"));
    assert_eq!(out2.recv().await.unwrap().id(), second.id().derive(0));
}

#[tokio::test]
async fn corrupt_checkpoint_halts_key_until_fallback() {
    let store = Arc::new(InMemStore::with_history(2));
    let (node1, _events1) = count_node("node1", &store, test_config());
    node1.acquire(KeyRange::full()).await.unwrap();
    let (first, second, third) = (
        Record::new("x", "a"),
        Record::new("x", "b"),
        Record::new("x", "c"),
    );
    node1.process(first.clone()).await.unwrap();
    node1.process(second.clone()).await.unwrap();
    node1.crash();

    let key = Key::from("x");
    store.corrupt(&key);
    let (node2, mut events2) = count_node("node2", &store, test_config());
    node2.acquire(KeyRange::full()).await.unwrap();

    assert_eq!(
        node2.process(third.clone()).await.unwrap(),
        Outcome::Rejected(Rejection::Corrupt)
    );
    match events2.recv().await.unwrap() {
        SupervisorEvent::Corrupt(corrupt) => {
            assert_eq!(corrupt.key, key);
            assert_eq!(corrupt.seq, SequenceNumber(2));
        }
        event => panic!("expected corruption, got {event:?}"),
    }
    assert_eq!(node2.phase(&key), Some(KeyPhase::Halted));
    assert_eq!(
        node2.process(third.clone()).await.unwrap(),
        Outcome::Rejected(Rejection::Corrupt)
    );

    let restored = node2
        .fallback(
            &key,
            DataLossAck {
                operator: "ops".into(),
                reason: "bit rot on x".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(restored.sequence_number, SequenceNumber(3));
    assert_eq!(count_of(&*store, "x"), Some(1));

    // The second record's effects were lost with its checkpoint.
    assert_eq!(
        node2.process(second).await.unwrap(),
        Outcome::Committed(SequenceNumber(4))
    );
    assert_eq!(node2.process(first).await.unwrap(), Outcome::Duplicate);
    assert_eq!(
        node2.process(third).await.unwrap(),
        Outcome::Committed(SequenceNumber(5))
    );
    assert_eq!(count_of(&*store, "x"), Some(3));
}

/// Counts records, but refuses ones with a `bad` payload.
struct Picky;

impl Logic for Picky {
    type State = u64;

    fn apply(&self, state: Option<&u64>, record: &Record) -> Result<Applied<u64>, LogicError> {
        if record.payload() == &Payload::from("bad") {
            return Err(LogicError("bad payload".into()));
        }
        CountLogic.apply(state, record)
    }
}

#[tokio::test]
async fn failing_logic_commits_nothing() {
    let store = Arc::new(InMemStore::new());
    let (node, _events) = ComputationNode::new(
        HolderId::from("node1"),
        Picky,
        store.clone(),
        Arc::new(Discard),
        test_config(),
    )
    .unwrap();
    node.acquire(KeyRange::full()).await.unwrap();

    let bad = Record::new("x", "bad");
    let outcome = node.process(bad.clone()).await.unwrap();
    assert_eq!(outcome, Outcome::Failed(LogicError("bad payload".into())));
    assert!(!outcome.should_ack());
    assert_eq!(store.load(&Key::from("x")).unwrap(), None);

    assert_eq!(
        node.process(Record::new("x", "good")).await.unwrap(),
        Outcome::Committed(SequenceNumber(1))
    );
    // A redelivery of the failed record is tried again.
    assert!(matches!(
        node.process(bad).await.unwrap(),
        Outcome::Failed(_)
    ));
    assert_eq!(count_of(&*store, "x"), Some(1));
}

#[tokio::test]
async fn status_and_committed_view() {
    let store = Arc::new(InMemStore::new());
    let (node, _events) = count_node("node1", &store, test_config());
    let range = KeyRange::between("a", "m");
    node.acquire(range.clone()).await.unwrap();
    node.process(Record::new("b", "x")).await.unwrap();

    let key = Key::from("b");
    let reader = node.reader(&key).unwrap();
    let view = reader.load().unwrap();
    assert_eq!(view.seq, SequenceNumber(1));
    assert_eq!(view.epoch, Epoch(1));
    assert_eq!(view.state::<u64>().unwrap(), Some(1));

    let status = node.status();
    assert_eq!(status.holder, HolderId::from("node1"));
    assert_eq!(status.ranges.len(), 1);
    assert_eq!(status.ranges[0].epoch, Epoch(1));
    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["keys"][0]["key"], "b");
    assert_eq!(json["keys"][0]["phase"], "idle");
    assert_eq!(json["keys"][0]["seq"], 1);

    assert!(node.release(&range));
    assert!(!node.release(&range));
    assert_eq!(
        node.process(Record::new("b", "y")).await.unwrap(),
        Outcome::Rejected(Rejection::NotOwned)
    );
    assert!(node.status().ranges.is_empty());
}

#[tokio::test]
async fn sqlite_end_to_end() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let (node1, _events1) = count_node("node1", &store, test_config());
    let (node2, _events2) = count_node("node2", &store, test_config());
    node1.acquire(KeyRange::full()).await.unwrap();

    let (first, second, third) = (
        Record::new("x", "a"),
        Record::new("x", "b"),
        Record::new("x", "c"),
    );
    assert_eq!(
        node1.process(first.clone()).await.unwrap(),
        Outcome::Committed(SequenceNumber(1))
    );
    assert_eq!(node1.process(first.clone()).await.unwrap(), Outcome::Duplicate);
    assert_eq!(
        node1.process(second).await.unwrap(),
        Outcome::Committed(SequenceNumber(2))
    );

    node2.acquire(KeyRange::full()).await.unwrap();
    assert_eq!(
        node1.process(third.clone()).await.unwrap(),
        Outcome::Rejected(Rejection::Suspended)
    );
    assert_eq!(
        node2.process(third).await.unwrap(),
        Outcome::Committed(SequenceNumber(3))
    );
    assert_eq!(node2.process(first).await.unwrap(), Outcome::Duplicate);
    assert_eq!(count_of(&*store, "x"), Some(3));
}
