//! Logging and tracing setup.
//!
//! Logging to stdout is always enabled, at least at the "ERROR" level.
//! Spans can additionally be exported to an OpenTelemetry collector;
//! by default they are not.
//!
//! Each tracing backend implements [`TracerBuilder`], which only has
//! to return the `Tracer` for the backend.

use opentelemetry::sdk::trace::Tracer;
use tokio::runtime::EnterGuard;
use tracing::level_filters::LevelFilter;
use tracing::Subscriber;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Layer;
use tracing_subscriber::Registry;

use crate::errors::ConfigError;
use crate::errors::EngineError;

pub mod otlp_tracing;

pub use otlp_tracing::OtlpTracingConfig;

const TARGET: &str = "millwheel_core";

trait TracerBuilder {
    fn build(&self) -> Result<Tracer, EngineError>;
}

/// Keeps the tokio runtime that exports traces alive as long as the
/// struct itself.
pub struct EngineTracer {
    rt: tokio::runtime::Runtime,
}

pub(crate) fn parse_log_level(level: &str) -> Result<LevelFilter, ConfigError> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(LevelFilter::TRACE),
        "debug" => Ok(LevelFilter::DEBUG),
        "info" => Ok(LevelFilter::INFO),
        "warn" => Ok(LevelFilter::WARN),
        "error" => Ok(LevelFilter::ERROR),
        "off" => Ok(LevelFilter::OFF),
        other => Err(ConfigError::Env {
            var: "MILLWHEEL_LOG_LEVEL",
            value: other.to_owned(),
            reason: "expected one of trace, debug, info, warn, error, off".to_owned(),
        }),
    }
}

impl EngineTracer {
    pub fn new() -> Result<Self, EngineError> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("millwheel-tracing")
            .enable_all()
            .build()
            .map_err(|err| EngineError::Internal(format!("error starting tracing runtime: {err}")))?;
        Ok(Self { rt })
    }

    /// Install the global subscriber.
    ///
    /// Returns a guard that has to be kept in scope for the whole
    /// execution of the code you want to trace.
    pub fn setup(
        &self,
        otlp: Option<OtlpTracingConfig>,
        log_level: &str,
    ) -> Result<EnterGuard<'_>, EngineError> {
        let log_level = parse_log_level(log_level)?;
        let guard = self.rt.enter();

        // The exporter has to be built within the runtime it runs on.
        let initializer = async move {
            let logs = tracing_subscriber::fmt::Layer::default()
                .compact()
                .with_file(true)
                .with_line_number(true)
                .with_thread_ids(true)
                .with_filter(Targets::new().with_target(TARGET, log_level));

            if let Some(conf) = otlp {
                let tracer = conf.build()?;
                let telemetry = tracing_opentelemetry::layer()
                    .with_tracer(tracer)
                    .with_filter(Targets::new().with_target(TARGET, LevelFilter::TRACE));
                set_global_subscriber(Registry::default().with(logs).with(telemetry));
            } else {
                set_global_subscriber(Registry::default().with(logs));
            }
            Ok::<_, EngineError>(())
        };
        self.rt
            .block_on(self.rt.spawn(initializer))
            .map_err(|err| EngineError::Internal(format!("tracing setup panicked: {err}")))??;
        Ok(guard)
    }
}

// Try to set a global default subscriber, logging the error without
// panicking if it was already set.
fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    // This fails if tracing was already initialized, which happens
    // when tests or embedders set up more than once per process.
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        tracing::warn!("{err}");
    }
}

#[test]
fn log_levels_parse() {
    assert_eq!(parse_log_level("DEBUG").unwrap(), LevelFilter::DEBUG);
    assert_eq!(parse_log_level("off").unwrap(), LevelFilter::OFF);
    assert!(matches!(
        parse_log_level("loud"),
        Err(ConfigError::Env { value, .. }) if value == "loud"
    ));
}

#[test]
fn setup_without_exporter() {
    let tracer = EngineTracer::new().unwrap();
    let guard = tracer.setup(None, "warn").unwrap();
    tracing::warn!(target: "millwheel_core", "logging is set up");
    drop(guard);
}
