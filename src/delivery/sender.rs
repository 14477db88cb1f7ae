//! Async driver of a [`DeliveryTracker`].

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::*;
use crate::metrics::DeliveryMetrics;

/// Moves records to a receiver.
///
/// Delivery is fire and forget: the transport may lose the record, or
/// deliver it more than once. The receiver acknowledges through the
/// [`AckHandle`] once the record's effects are committed.
pub trait Transport: Send + Sync + 'static {
    /// Must not block.
    fn deliver(&self, record: Record, attempt: u32, ack: AckHandle);
}

struct Shared {
    tracker: Mutex<DeliveryTracker>,
    metrics: DeliveryMetrics,
}

impl Shared {
    fn tracker(&self) -> MutexGuard<'_, DeliveryTracker> {
        self.tracker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Acknowledges records to the [`Sender`] that sent them.
///
/// Cheap to clone. Acking is idempotent.
#[derive(Clone)]
pub struct AckHandle {
    shared: Arc<Shared>,
}

impl AckHandle {
    /// Returns whether the record was still waiting for its ack.
    pub fn ack(&self, record_id: &RecordId) -> bool {
        let found = self.shared.tracker().ack(record_id);
        if found {
            self.shared.metrics.acked.add(1, &self.shared.metrics.labels);
        }
        found
    }
}

/// One sender relationship: submits records through a transport and
/// retries them until they are acked or run out of attempts.
///
/// Records that run out of attempts are reported on the channel
/// returned by [`Sender::start`]. The retry timer stops when the
/// sender is dropped.
pub struct Sender {
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    timer: JoinHandle<()>,
}

impl Sender {
    /// Start a sender. Must be called within a tokio runtime.
    pub fn start(
        name: &str,
        config: &DeliveryConfig,
        transport: Arc<dyn Transport>,
    ) -> (Self, mpsc::UnboundedReceiver<DeliveryExhausted>) {
        let shared = Arc::new(Shared {
            tracker: Mutex::new(DeliveryTracker::new(config)),
            metrics: DeliveryMetrics::new(name),
        });
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();

        let timer = tokio::spawn(retry_loop(
            config.tick,
            shared.clone(),
            transport.clone(),
            failures_tx,
        ));
        tracing::debug!("Started sender {name}");
        (
            Self {
                shared,
                transport,
                timer,
            },
            failures_rx,
        )
    }

    /// Submit a record for at-least-once delivery.
    ///
    /// Fails without sending anything when too many records are
    /// waiting for their ack.
    pub fn submit(&self, record: Record) -> Result<(), Backpressure> {
        let metrics = &self.shared.metrics;
        let pending = self
            .shared
            .tracker()
            .send(record.clone(), Instant::now())
            .map_err(|err| {
                metrics.backpressure.add(1, &metrics.labels);
                err
            })?;
        metrics.sent.add(1, &metrics.labels);
        self.transport
            .deliver(record, pending.attempt, self.ack_handle());
        Ok(())
    }

    pub fn ack_handle(&self) -> AckHandle {
        AckHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn outstanding(&self) -> usize {
        self.shared.tracker().outstanding()
    }

    pub fn is_pending(&self, record_id: &RecordId) -> bool {
        self.shared.tracker().is_pending(record_id)
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        self.timer.abort();
    }
}

async fn retry_loop(
    tick: std::time::Duration,
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    failures: mpsc::UnboundedSender<DeliveryExhausted>,
) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let now = Instant::now();

        // Decide under the lock, deliver outside of it; a transport
        // may ack synchronously.
        let timeouts: Vec<_> = {
            let mut tracker = shared.tracker();
            tracker
                .due(now)
                .into_iter()
                .map(|id| tracker.on_timeout(&id, now))
                .collect()
        };

        for timeout in timeouts {
            match timeout {
                Timeout::Redeliver(record, attempt) => {
                    shared.metrics.redelivered.add(1, &shared.metrics.labels);
                    transport.deliver(
                        record,
                        attempt,
                        AckHandle {
                            shared: shared.clone(),
                        },
                    );
                }
                Timeout::Exhausted(exhausted) => {
                    shared.metrics.exhausted.add(1, &shared.metrics.labels);
                    if failures.send(exhausted).is_err() {
                        tracing::warn!("Delivery failure receiver dropped; failure not reported");
                    }
                }
                Timeout::NotPending => {}
            }
        }
    }
}

/// Records every delivery; acks the ones it is told to.
#[cfg(test)]
#[derive(Default)]
struct RecordingTransport {
    deliveries: Mutex<Vec<(RecordId, u32)>>,
    /// Ack on this attempt number, if any.
    ack_on_attempt: Option<u32>,
}

#[cfg(test)]
impl Transport for RecordingTransport {
    fn deliver(&self, record: Record, attempt: u32, ack: AckHandle) {
        self.deliveries.lock().unwrap().push((record.id(), attempt));
        if self.ack_on_attempt == Some(attempt) {
            ack.ack(&record.id());
        }
    }
}

#[tokio::test(start_paused = true)]
async fn retries_until_acked() {
    use std::time::Duration;

    let transport = Arc::new(RecordingTransport {
        ack_on_attempt: Some(3),
        ..Default::default()
    });
    let (sender, mut failures) = Sender::start("test", &test_config(5, 10), transport.clone());

    let record = Record::new("x", "a");
    sender.submit(record.clone()).unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(
        *transport.deliveries.lock().unwrap(),
        vec![(record.id(), 1), (record.id(), 2), (record.id(), 3)]
    );
    assert_eq!(sender.outstanding(), 0);
    assert!(failures.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn exhaustion_is_reported() {
    use std::time::Duration;

    let transport = Arc::new(RecordingTransport::default());
    let (sender, mut failures) = Sender::start("test", &test_config(2, 10), transport.clone());

    let record = Record::new("x", "a");
    sender.submit(record.clone()).unwrap();
    let exhausted = tokio::time::timeout(Duration::from_secs(10), failures.recv())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(exhausted.record_id, record.id());
    assert_eq!(exhausted.attempts, 2);
    assert_eq!(transport.deliveries.lock().unwrap().len(), 2);
    assert!(!sender.is_pending(&record.id()));
}

#[tokio::test(start_paused = true)]
async fn submit_signals_backpressure() {
    let transport = Arc::new(RecordingTransport::default());
    let (sender, _failures) = Sender::start("test", &test_config(2, 1), transport.clone());

    sender.submit(Record::new("x", "a")).unwrap();
    let err = sender.submit(Record::new("x", "b")).unwrap_err();
    assert_eq!(err.limit, 1);
    assert_eq!(transport.deliveries.lock().unwrap().len(), 1);
}
