//! Engine configuration.
//!
//! Everything has a default. A config can be read from a JSON file
//! and individual settings overridden from `MILLWHEEL_*` environment
//! variables, in that order.
//!
//! Checkpoint frequency and dedup retention are deliberately
//! independent knobs. The only coupling enforced is a warning when
//! the retention window is shorter than the longest time a sender may
//! still redeliver a record, since a purged dedup entry followed by a
//! late redelivery would be processed twice.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::errors::ConfigError;
use crate::retry::Backoff;

/// Serialize [`Duration`]s as integer milliseconds.
pub(crate) mod serde_millis {
    use std::time::Duration;

    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub(crate) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis().min(u64::MAX as u128) as u64)
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// When key workers write checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CheckpointPolicy {
    /// Checkpoint after every fresh record. Lowest latency to ACK.
    PerRecord,
    /// Batch records for up to `interval` or `max_batch` records,
    /// whichever comes first, then checkpoint them together. Upstream
    /// ACKs wait for the batch to commit.
    Interval {
        #[serde(with = "serde_millis")]
        interval: Duration,
        max_batch: usize,
    },
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self::PerRecord
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Use the probabilistic layer in front of the durable dedup log.
    pub probabilistic: bool,
    /// Size of each of the probabilistic layer's two generations in
    /// bits. Generations rotate every `retention`.
    pub bloom_bits: usize,
    /// Number of hash functions of the probabilistic layer.
    pub bloom_hashes: u32,
    /// How long durable dedup entries are kept after commit.
    #[serde(with = "serde_millis")]
    pub retention: Duration,
    /// How often expired entries are purged, per key.
    #[serde(with = "serde_millis")]
    pub purge_interval: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            probabilistic: true,
            bloom_bits: 1 << 23,
            bloom_hashes: 7,
            retention: Duration::from_secs(15 * 60),
            purge_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub backoff: Backoff,
    /// Total delivery attempts per record, including the first.
    pub max_attempts: u32,
    /// Unacknowledged records a sender may have outstanding before
    /// `submit` signals backpressure.
    pub max_outstanding: usize,
    /// How often the sender checks for timed out deliveries.
    #[serde(with = "serde_millis")]
    pub tick: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            max_attempts: 8,
            max_outstanding: 10_000,
            tick: Duration::from_millis(50),
        }
    }
}

impl DeliveryConfig {
    /// Longest time after the first send that a record can still be
    /// redelivered.
    pub fn redelivery_horizon(&self) -> Duration {
        self.backoff.horizon(self.max_attempts)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreRetryConfig {
    pub backoff: Backoff,
    /// Attempts per checkpoint before the key reports itself stalled
    /// and starts over on its next tick.
    pub max_attempts: u32,
}

impl Default for StoreRetryConfig {
    fn default() -> Self {
        Self {
            backoff: Backoff {
                initial: Duration::from_millis(20),
                max: Duration::from_secs(2),
                multiplier: 2.0,
                jitter: 0.2,
            },
            max_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub checkpoint: CheckpointPolicy,
    pub dedup: DedupConfig,
    pub delivery: DeliveryConfig,
    pub store_retry: StoreRetryConfig,
    /// Records buffered per key worker before `process` waits.
    pub key_queue_capacity: usize,
    /// Port of the HTTP status API, if it is started.
    pub status_api_port: u16,
    /// Log level for the `millwheel_core` target.
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            checkpoint: CheckpointPolicy::default(),
            dedup: DedupConfig::default(),
            delivery: DeliveryConfig::default(),
            store_retry: StoreRetryConfig::default(),
            key_queue_capacity: 1024,
            status_api_port: 3030,
            log_level: "error".to_owned(),
        }
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(var)
        .map(|value| {
            value.parse().map_err(|err: T::Err| ConfigError::Env {
                var,
                value: value.clone(),
                reason: err.to_string(),
            })
        })
        .transpose()
}

impl EngineConfig {
    /// Load a config from a JSON file. Missing fields keep their
    /// defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }

    /// Apply overrides from the process environment.
    pub fn from_env(self) -> Result<Self, ConfigError> {
        self.with_overrides(|var| std::env::var(var).ok())
    }

    /// Apply overrides using a custom variable lookup.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        // An interval of zero means per-record checkpoints.
        if let Some(ms) = parse_var::<u64>(&lookup, "MILLWHEEL_CHECKPOINT_INTERVAL_MS")? {
            self.checkpoint = if ms == 0 {
                CheckpointPolicy::PerRecord
            } else {
                let max_batch = match self.checkpoint {
                    CheckpointPolicy::Interval { max_batch, .. } => max_batch,
                    CheckpointPolicy::PerRecord => 1024,
                };
                CheckpointPolicy::Interval {
                    interval: Duration::from_millis(ms),
                    max_batch,
                }
            };
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "MILLWHEEL_DEDUP_RETENTION_MS")? {
            self.dedup.retention = Duration::from_millis(ms);
        }
        if let Some(on) = parse_var::<bool>(&lookup, "MILLWHEEL_DEDUP_PROBABILISTIC")? {
            self.dedup.probabilistic = on;
        }
        if let Some(n) = parse_var::<u32>(&lookup, "MILLWHEEL_DELIVERY_MAX_ATTEMPTS")? {
            self.delivery.max_attempts = n;
        }
        if let Some(n) = parse_var::<usize>(&lookup, "MILLWHEEL_DELIVERY_MAX_OUTSTANDING")? {
            self.delivery.max_outstanding = n;
        }
        if let Some(port) = parse_var::<u16>(&lookup, "MILLWHEEL_STATUS_API_PORT")? {
            self.status_api_port = port;
        }
        if let Some(level) = lookup("MILLWHEEL_LOG_LEVEL") {
            self.log_level = level;
        }
        Ok(self)
    }

    /// Reject unusable settings and warn about risky combinations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let CheckpointPolicy::Interval {
            interval,
            max_batch,
        } = self.checkpoint
        {
            if interval.is_zero() || max_batch == 0 {
                return Err(ConfigError::Invalid(
                    "checkpoint interval and max batch must be positive".into(),
                ));
            }
        }
        if self.delivery.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "delivery needs at least one attempt".into(),
            ));
        }
        if self.store_retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "store retries need at least one attempt".into(),
            ));
        }
        if self.key_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "key queue capacity must be positive".into(),
            ));
        }
        if self.dedup.probabilistic && (self.dedup.bloom_bits < 64 || self.dedup.bloom_hashes == 0)
        {
            return Err(ConfigError::Invalid(
                "bloom filter needs at least 64 bits and one hash".into(),
            ));
        }

        let horizon = self.delivery.redelivery_horizon();
        if self.dedup.retention < horizon {
            tracing::warn!(
                "Dedup retention {:?} is shorter than the redelivery horizon {horizon:?}; \
                 late redeliveries may be processed twice",
                self.dedup.retention
            );
        }
        Ok(())
    }
}

#[test]
fn defaults_validate() {
    assert!(EngineConfig::default().validate().is_ok());
}

#[test]
fn env_overrides_apply() {
    let vars = std::collections::HashMap::from([
        ("MILLWHEEL_CHECKPOINT_INTERVAL_MS", "250"),
        ("MILLWHEEL_DEDUP_RETENTION_MS", "60000"),
        ("MILLWHEEL_DEDUP_PROBABILISTIC", "false"),
        ("MILLWHEEL_STATUS_API_PORT", "9999"),
    ]);
    let config = EngineConfig::default()
        .with_overrides(|var| vars.get(var).map(|v| v.to_string()))
        .unwrap();

    assert_eq!(
        config.checkpoint,
        CheckpointPolicy::Interval {
            interval: Duration::from_millis(250),
            max_batch: 1024,
        }
    );
    assert_eq!(config.dedup.retention, Duration::from_secs(60));
    assert!(!config.dedup.probabilistic);
    assert_eq!(config.status_api_port, 9999);
}

#[test]
fn bad_env_value_is_reported() {
    let err = EngineConfig::default()
        .with_overrides(|var| (var == "MILLWHEEL_DELIVERY_MAX_ATTEMPTS").then(|| "many".to_owned()))
        .unwrap_err();
    assert!(
        matches!(err, ConfigError::Env { var: "MILLWHEEL_DELIVERY_MAX_ATTEMPTS", .. }),
        "{err}"
    );
}

#[test]
fn zero_batch_is_invalid() {
    let config = EngineConfig {
        checkpoint: CheckpointPolicy::Interval {
            interval: Duration::from_millis(10),
            max_batch: 0,
        },
        ..Default::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn partial_json_keeps_defaults() {
    let config: EngineConfig = serde_json::from_str(
        r#"{"checkpoint": {"mode": "interval", "interval": 500, "max_batch": 64},
            "dedup": {"retention": 1000}}"#,
    )
    .unwrap();
    assert_eq!(
        config.checkpoint,
        CheckpointPolicy::Interval {
            interval: Duration::from_millis(500),
            max_batch: 64,
        }
    );
    assert_eq!(config.dedup.retention, Duration::from_secs(1));
    assert_eq!(config.dedup.bloom_hashes, 7);
    assert_eq!(config.delivery, DeliveryConfig::default());
}

#[test]
fn from_file_reads_json() {
    use std::io::Write;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{"key_queue_capacity": 16}}"#).unwrap();
    let config = EngineConfig::from_file(file.path()).unwrap();
    assert_eq!(config.key_queue_capacity, 16);
}
