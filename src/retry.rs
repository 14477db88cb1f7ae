//! Exponential backoff shared by delivery retries and store retries.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::config::serde_millis;
use crate::errors::StoreError;

/// Exponential backoff schedule.
///
/// Attempt `n` (zero based) waits `initial * multiplier^n`, capped at
/// `max`, then spread by up to `jitter` (a fraction of the delay) in
/// either direction so retries from many senders don't line up.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Backoff {
    #[serde(with = "serde_millis")]
    pub initial: Duration,
    #[serde(with = "serde_millis")]
    pub max: Duration,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl Backoff {
    /// Backoff without jitter. Handy for deterministic schedules.
    pub fn fixed_ratio(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max,
            multiplier,
            jitter: 0.0,
        }
    }

    /// Delay before retry `attempt`, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        let secs = self.initial.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Delay before retry `attempt`, with jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        // Uniform in [-jitter, +jitter].
        let spread = (fastrand::f64() * 2.0 - 1.0) * self.jitter.min(1.0);
        base.mul_f64((1.0 + spread).max(0.0))
    }

    /// Longest total time the first `attempts` retries can take.
    ///
    /// This is how long a sender may still redeliver a record after
    /// first sending it.
    pub fn horizon(&self, attempts: u32) -> Duration {
        (0..attempts)
            .map(|attempt| self.base_delay(attempt).mul_f64(1.0 + self.jitter.clamp(0.0, 1.0)))
            .sum()
    }
}

#[test]
fn base_delay_grows_and_caps() {
    let backoff = Backoff::fixed_ratio(Duration::from_millis(100), Duration::from_secs(1), 2.0);
    assert_eq!(backoff.base_delay(0), Duration::from_millis(100));
    assert_eq!(backoff.base_delay(1), Duration::from_millis(200));
    assert_eq!(backoff.base_delay(3), Duration::from_millis(800));
    assert_eq!(backoff.base_delay(4), Duration::from_secs(1));
    assert_eq!(backoff.base_delay(1000), Duration::from_secs(1));
}

#[test]
fn jitter_stays_in_bounds() {
    let backoff = Backoff {
        initial: Duration::from_millis(100),
        max: Duration::from_secs(1),
        multiplier: 2.0,
        jitter: 0.5,
    };
    for _ in 0..100 {
        let delay = backoff.delay(1);
        assert!(delay >= Duration::from_millis(100), "{delay:?}");
        assert!(delay <= Duration::from_millis(300), "{delay:?}");
    }
}

#[test]
fn horizon_sums_schedule() {
    let backoff = Backoff::fixed_ratio(Duration::from_millis(100), Duration::from_secs(1), 2.0);
    assert_eq!(backoff.horizon(3), Duration::from_millis(700));
    assert_eq!(backoff.horizon(0), Duration::ZERO);
}

/// Run a store operation, retrying transient failures.
///
/// Gives up after `max_attempts` and returns the last transient
/// error. Any non-transient error is returned immediately.
pub(crate) async fn retry_transient<T, F, Fut>(
    backoff: &Backoff,
    max_attempts: u32,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Err(err) if err.is_transient() && attempt + 1 < max_attempts => {
                let delay = backoff.delay(attempt);
                tracing::warn!("{err}; retry {} in {delay:?}", attempt + 1);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            res => return res,
        }
    }
}

#[tokio::test(start_paused = true)]
async fn retry_transient_retries_until_success() {
    let backoff = Backoff::fixed_ratio(Duration::from_millis(10), Duration::from_millis(50), 2.0);
    let res = retry_transient(&backoff, 5, |attempt| async move {
        if attempt < 2 {
            Err(StoreError::Transient("busy".into()))
        } else {
            Ok(attempt)
        }
    })
    .await;
    assert_eq!(res, Ok(2));
}

#[tokio::test(start_paused = true)]
async fn retry_transient_gives_up_and_skips_fatal() {
    let backoff = Backoff::fixed_ratio(Duration::from_millis(10), Duration::from_millis(50), 2.0);
    let mut calls = 0;
    let res: Result<(), _> = retry_transient(&backoff, 3, |_| {
        calls += 1;
        async { Err(StoreError::Transient("busy".into())) }
    })
    .await;
    assert!(res.unwrap_err().is_transient());
    assert_eq!(calls, 3);

    let mut calls = 0;
    let res: Result<(), _> = retry_transient(&backoff, 3, |_| {
        calls += 1;
        async { Err(StoreError::Backend("constraint".into())) }
    })
    .await;
    assert_eq!(res, Err(StoreError::Backend("constraint".into())));
    assert_eq!(calls, 1);
}
