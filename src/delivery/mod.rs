//! At-least-once delivery bookkeeping.
//!
//! A [`DeliveryTracker`] belongs to exactly one sender relationship.
//! It remembers every record sent and not yet acknowledged, and when
//! each one should be retried. There is no process-wide registry;
//! dropping the tracker drops its bookkeeping.
//!
//! The tracker is a plain state machine driven by the caller's clock.
//! [`sender::Sender`] drives one on a tokio timer and hands records to
//! a transport.
//!
//! Redelivering a record reuses its ID. Telling a redelivery apart
//! from the first attempt is the receiver's dedup filter's job, not
//! the tracker's.

use std::collections::HashMap;

use chrono::DateTime;
use chrono::Utc;
use tokio::time::Instant;

use crate::config::DeliveryConfig;
use crate::errors::Backpressure;
use crate::errors::DeliveryExhausted;
use crate::record::Record;
use crate::record::RecordId;
use crate::retry::Backoff;

pub mod sender;

/// A record registered for delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pending {
    pub record_id: RecordId,
    /// 1 for the first attempt.
    pub attempt: u32,
    /// When the current attempt times out without an ack.
    pub deadline: Instant,
}

/// What to do about a record whose ack didn't arrive in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Timeout {
    /// Send the record again. This is attempt number `attempt`.
    Redeliver(Record, u32),
    /// Retry budget used up. The record is no longer tracked.
    Exhausted(DeliveryExhausted),
    /// Already acked or exhausted.
    NotPending,
}

#[derive(Debug)]
struct InFlight {
    record: Record,
    attempts: u32,
    first_sent_at: DateTime<Utc>,
    deadline: Instant,
}

/// Unacknowledged records of one sender and their retry schedule.
#[derive(Debug)]
pub struct DeliveryTracker {
    in_flight: HashMap<RecordId, InFlight>,
    backoff: Backoff,
    max_attempts: u32,
    max_outstanding: usize,
}

impl DeliveryTracker {
    pub fn new(config: &DeliveryConfig) -> Self {
        Self {
            in_flight: HashMap::new(),
            backoff: config.backoff,
            max_attempts: config.max_attempts.max(1),
            max_outstanding: config.max_outstanding,
        }
    }

    /// Start tracking a record.
    ///
    /// Sending a record that is already in flight doesn't reset its
    /// schedule or budget.
    pub fn send(&mut self, record: Record, now: Instant) -> Result<Pending, Backpressure> {
        let record_id = record.id();
        if let Some(in_flight) = self.in_flight.get(&record_id) {
            return Ok(Pending {
                record_id,
                attempt: in_flight.attempts,
                deadline: in_flight.deadline,
            });
        }
        if self.in_flight.len() >= self.max_outstanding {
            return Err(Backpressure {
                outstanding: self.in_flight.len(),
                limit: self.max_outstanding,
            });
        }

        let deadline = now + self.backoff.delay(0);
        tracing::trace!("Tracking delivery of {record_id}");
        self.in_flight.insert(
            record_id,
            InFlight {
                record,
                attempts: 1,
                first_sent_at: Utc::now(),
                deadline,
            },
        );
        Ok(Pending {
            record_id,
            attempt: 1,
            deadline,
        })
    }

    /// Stop tracking an acknowledged record.
    ///
    /// Returns whether it was still in flight. Acking twice, or after
    /// exhaustion, is harmless.
    pub fn ack(&mut self, record_id: &RecordId) -> bool {
        let found = self.in_flight.remove(record_id).is_some();
        if !found {
            tracing::trace!("Ignoring ack of {record_id} which is not in flight");
        }
        found
    }

    /// Handle a record's ack timeout.
    pub fn on_timeout(&mut self, record_id: &RecordId, now: Instant) -> Timeout {
        let Some(in_flight) = self.in_flight.get_mut(record_id) else {
            return Timeout::NotPending;
        };
        if in_flight.attempts >= self.max_attempts {
            let in_flight = self.in_flight.remove(record_id);
            return match in_flight {
                Some(in_flight) => {
                    let exhausted = DeliveryExhausted {
                        record_id: *record_id,
                        key: in_flight.record.key().clone(),
                        attempts: in_flight.attempts,
                        first_sent_at: in_flight.first_sent_at,
                    };
                    tracing::warn!("{exhausted}");
                    Timeout::Exhausted(exhausted)
                }
                None => Timeout::NotPending,
            };
        }

        let delay = self.backoff.delay(in_flight.attempts);
        in_flight.attempts += 1;
        in_flight.deadline = now + delay;
        tracing::debug!(
            "Redelivering {record_id}, attempt {} of {}; next timeout in {delay:?}",
            in_flight.attempts,
            self.max_attempts
        );
        Timeout::Redeliver(in_flight.record.clone(), in_flight.attempts)
    }

    /// Records whose current attempt timed out, earliest first.
    pub fn due(&self, now: Instant) -> Vec<RecordId> {
        let mut due: Vec<_> = self
            .in_flight
            .iter()
            .filter(|(_, in_flight)| in_flight.deadline <= now)
            .map(|(id, in_flight)| (in_flight.deadline, *id))
            .collect();
        due.sort();
        due.into_iter().map(|(_, id)| id).collect()
    }

    pub fn outstanding(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_pending(&self, record_id: &RecordId) -> bool {
        self.in_flight.contains_key(record_id)
    }
}

#[cfg(test)]
fn test_config(max_attempts: u32, max_outstanding: usize) -> DeliveryConfig {
    use std::time::Duration;

    DeliveryConfig {
        backoff: Backoff::fixed_ratio(Duration::from_millis(100), Duration::from_secs(1), 2.0),
        max_attempts,
        max_outstanding,
        tick: Duration::from_millis(10),
    }
}

#[test]
fn redelivers_on_backoff_schedule() {
    use std::time::Duration;

    let mut tracker = DeliveryTracker::new(&test_config(3, 10));
    let t0 = Instant::now();
    let record = Record::new("x", "a");
    let id = record.id();

    let pending = tracker.send(record.clone(), t0).unwrap();
    assert_eq!(pending.attempt, 1);
    assert_eq!(pending.deadline, t0 + Duration::from_millis(100));
    assert!(tracker.due(t0 + Duration::from_millis(99)).is_empty());
    assert_eq!(tracker.due(t0 + Duration::from_millis(100)), vec![id]);

    let t1 = t0 + Duration::from_millis(100);
    assert_eq!(tracker.on_timeout(&id, t1), Timeout::Redeliver(record.clone(), 2));
    assert_eq!(tracker.due(t1 + Duration::from_millis(199)), vec![]);
    assert_eq!(tracker.due(t1 + Duration::from_millis(200)), vec![id]);

    let t2 = t1 + Duration::from_millis(200);
    assert_eq!(tracker.on_timeout(&id, t2), Timeout::Redeliver(record, 3));

    match tracker.on_timeout(&id, t2 + Duration::from_millis(400)) {
        Timeout::Exhausted(exhausted) => {
            assert_eq!(exhausted.record_id, id);
            assert_eq!(exhausted.attempts, 3);
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
    assert_eq!(tracker.outstanding(), 0);
    assert_eq!(tracker.on_timeout(&id, t2), Timeout::NotPending);
}

#[test]
fn ack_is_idempotent() {
    let mut tracker = DeliveryTracker::new(&test_config(3, 10));
    let record = Record::new("x", "a");
    let id = record.id();
    tracker.send(record, Instant::now()).unwrap();

    assert!(tracker.ack(&id));
    assert!(!tracker.ack(&id));
    assert!(!tracker.is_pending(&id));
    assert_eq!(tracker.on_timeout(&id, Instant::now()), Timeout::NotPending);
}

#[test]
fn backpressure_when_budget_is_used() {
    let mut tracker = DeliveryTracker::new(&test_config(3, 2));
    let now = Instant::now();
    let first = Record::new("x", "a");
    tracker.send(first.clone(), now).unwrap();
    tracker.send(Record::new("x", "b"), now).unwrap();

    assert_eq!(
        tracker.send(Record::new("x", "c"), now),
        Err(Backpressure {
            outstanding: 2,
            limit: 2,
        })
    );
    // Resending something in flight is not new work.
    assert!(tracker.send(first.clone(), now).is_ok());

    tracker.ack(&first.id());
    assert!(tracker.send(Record::new("x", "c"), now).is_ok());
}

#[test]
fn due_is_ordered_by_deadline() {
    use std::time::Duration;

    let mut tracker = DeliveryTracker::new(&test_config(3, 10));
    let t0 = Instant::now();
    let late = Record::new("x", "late");
    let early = Record::new("x", "early");
    tracker.send(late.clone(), t0 + Duration::from_millis(50)).unwrap();
    tracker.send(early.clone(), t0).unwrap();

    assert_eq!(
        tracker.due(t0 + Duration::from_secs(1)),
        vec![early.id(), late.id()]
    );
}
