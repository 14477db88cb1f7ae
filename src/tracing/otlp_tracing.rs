use opentelemetry::runtime::Tokio;
use opentelemetry::sdk::trace::config;
use opentelemetry::sdk::trace::Sampler;
use opentelemetry::sdk::trace::Tracer;
use opentelemetry::sdk::Resource;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use serde::Deserialize;
use serde::Serialize;

use super::TracerBuilder;
use crate::errors::EngineError;

/// Send traces to an OpenTelemetry collector.
///
/// Only supports the GRPC protocol, so make sure to enable it on the
/// collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OtlpTracingConfig {
    /// Identifies this node in the traces.
    pub service_name: String,
    /// Collector URL. Defaults to `grpc://127.0.0.1:4317`.
    pub url: Option<String>,
    /// Fraction of traces sampled. `1.0` and above samples all of
    /// them.
    pub sampling_ratio: f64,
}

impl OtlpTracingConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            url: None,
            sampling_ratio: 1.0,
        }
    }
}

impl TracerBuilder for OtlpTracingConfig {
    fn build(&self) -> Result<Tracer, EngineError> {
        let mut exporter = opentelemetry_otlp::new_exporter().tonic();
        if let Some(endpoint) = self.url.as_ref() {
            exporter = exporter.with_endpoint(endpoint);
        }

        opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(
                config()
                    .with_sampler(Sampler::TraceIdRatioBased(self.sampling_ratio))
                    .with_resource(Resource::new(vec![KeyValue::new(
                        "service.name",
                        self.service_name.clone(),
                    )])),
            )
            .install_batch(Tokio)
            .map_err(|err| EngineError::Internal(format!("error installing tracer: {err}")))
    }
}
