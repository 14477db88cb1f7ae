//! OpenTelemetry meters exported through Prometheus.
//!
//! Components create their instruments from the global meter when
//! they are constructed. Until [`initialize_metrics`] installs a
//! provider the global one is a no-op, so tests and embedders that
//! don't care about metrics pay nothing.

use opentelemetry::global;
use opentelemetry::metrics::Counter;
use opentelemetry::metrics::Histogram;
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::Aggregation;
use opentelemetry_sdk::metrics::Instrument;
use opentelemetry_sdk::metrics::MeterProvider;
use opentelemetry_sdk::metrics::Stream;
use prometheus::default_registry;
use prometheus::Encoder;
use prometheus::TextEncoder;

use crate::errors::EngineError;

#[macro_export]
macro_rules! with_timer {
    ($histogram: expr, $labels: expr, $body: expr) => {{
        let now = std::time::Instant::now();
        let res = $body;
        $histogram.record(now.elapsed().as_secs_f64(), &$labels);
        res
    }};
}

/// Initialize the global registry for Prometheus metrics,
/// and create a global MeterProvider.
pub fn initialize_metrics() -> Result<(), EngineError> {
    // Initialize the global default registry for prometheus metrics
    // as internally it's a lazy static.
    let registry = default_registry();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .with_namespace("millwheel")
        .build()
        .map_err(|err| EngineError::Internal(err.to_string()))?;

    let provider = MeterProvider::builder()
        .with_reader(exporter)
        .with_view(
            opentelemetry_sdk::metrics::new_view(
                Instrument::new().name("*duration*"), // Must match histogram name
                Stream::new().aggregation(Aggregation::ExplicitBucketHistogram {
                    boundaries: vec![
                        0.0, 0.0005, 0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0,
                        2.5, 5.0, 7.5, 10.0,
                    ],
                    record_min_max: true,
                }),
            )
            .map_err(|err| EngineError::Internal(err.to_string()))?,
        )
        .build();
    global::set_meter_provider(provider);
    Ok(())
}

/// Everything in the default registry in the Prometheus text format.
pub fn render() -> Result<String, EngineError> {
    let mut buf = Vec::new();
    TextEncoder::new()
        .encode(&default_registry().gather(), &mut buf)
        .map_err(|err| EngineError::Internal(err.to_string()))?;
    String::from_utf8(buf).map_err(|err| EngineError::Internal(err.to_string()))
}

/// Instruments of one [`crate::delivery::sender::Sender`].
pub(crate) struct DeliveryMetrics {
    pub(crate) sent: Counter<u64>,
    pub(crate) redelivered: Counter<u64>,
    pub(crate) acked: Counter<u64>,
    pub(crate) exhausted: Counter<u64>,
    pub(crate) backpressure: Counter<u64>,
    pub(crate) labels: Vec<KeyValue>,
}

impl DeliveryMetrics {
    pub(crate) fn new(sender: &str) -> Self {
        let meter = global::meter("millwheel");
        Self {
            sent: meter
                .u64_counter("delivery_sent_count")
                .with_description("number of records submitted for delivery")
                .init(),
            redelivered: meter
                .u64_counter("delivery_redelivered_count")
                .with_description("number of redeliveries after an ack timeout")
                .init(),
            acked: meter
                .u64_counter("delivery_acked_count")
                .with_description("number of records acknowledged by the receiver")
                .init(),
            exhausted: meter
                .u64_counter("delivery_exhausted_count")
                .with_description("number of records that ran out of delivery attempts")
                .init(),
            backpressure: meter
                .u64_counter("delivery_backpressure_count")
                .with_description("number of submissions rejected by backpressure")
                .init(),
            labels: vec![KeyValue::new("sender", sender.to_owned())],
        }
    }
}

/// Instruments of one [`crate::node::ComputationNode`].
pub(crate) struct NodeMetrics {
    pub(crate) records_in: Counter<u64>,
    pub(crate) duplicates: Counter<u64>,
    pub(crate) commits: Counter<u64>,
    pub(crate) stale_rejections: Counter<u64>,
    pub(crate) store_retries: Counter<u64>,
    pub(crate) downstream_backpressure: Counter<u64>,
    pub(crate) logic_duration: Histogram<f64>,
    pub(crate) checkpoint_duration: Histogram<f64>,
    pub(crate) labels: Vec<KeyValue>,
}

impl NodeMetrics {
    pub(crate) fn new(holder: &str) -> Self {
        let meter = global::meter("millwheel");
        Self {
            records_in: meter
                .u64_counter("node_record_inp_count")
                .with_description("number of records this node has received")
                .init(),
            duplicates: meter
                .u64_counter("node_duplicate_count")
                .with_description("number of records acked without processing as duplicates")
                .init(),
            commits: meter
                .u64_counter("node_checkpoint_count")
                .with_description("number of checkpoints committed")
                .init(),
            stale_rejections: meter
                .u64_counter("node_stale_writer_count")
                .with_description("number of checkpoints rejected by fencing")
                .init(),
            store_retries: meter
                .u64_counter("node_store_retry_count")
                .with_description("number of transient store failures retried")
                .init(),
            downstream_backpressure: meter
                .u64_counter("node_downstream_backpressure_count")
                .with_description("number of committed records downstream refused for now")
                .init(),
            logic_duration: meter
                .f64_histogram("node_logic_duration_seconds")
                .with_description("user function duration in seconds")
                .init(),
            checkpoint_duration: meter
                .f64_histogram("node_checkpoint_duration_seconds")
                .with_description("checkpoint write duration in seconds, including retries")
                .init(),
            labels: vec![KeyValue::new("holder", holder.to_owned())],
        }
    }
}
