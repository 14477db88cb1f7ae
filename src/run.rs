//! Running a node as a process.
//!
//! [`run_main`] sets up everything around a node the way its
//! [`EngineConfig`] asks for: logging at `log_level`, optionally
//! exporting spans, Prometheus metrics, and the status API on
//! `status_api_port` when `MILLWHEEL_STATUS_API_ENABLED` is set. Then
//! it builds the node and runs the caller's workload on it.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::metrics::initialize_metrics;
use crate::node::ComputationNode;
use crate::node::Logic;
use crate::node::SupervisorEvent;
use crate::tracing::EngineTracer;
use crate::tracing::OtlpTracingConfig;
use crate::webserver;

/// Build a node with `build` and run `main` on it.
///
/// Blocks until `main` finishes. Must be called from outside of any
/// tokio runtime, once per process.
///
/// Metrics are set up before `build` runs, since components create
/// their instruments when they are constructed.
pub fn run_main<L, B, F, Fut, T>(
    config: EngineConfig,
    otlp: Option<OtlpTracingConfig>,
    build: B,
    main: F,
) -> Result<T, EngineError>
where
    L: Logic,
    B: FnOnce(
        EngineConfig,
    ) -> Result<
        (
            ComputationNode<L>,
            mpsc::UnboundedReceiver<SupervisorEvent>,
        ),
        EngineError,
    >,
    F: FnOnce(ComputationNode<L>, mpsc::UnboundedReceiver<SupervisorEvent>) -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let tracer = EngineTracer::new()?;
    let _guard = tracer.setup(otlp, &config.log_level)?;

    // Only fails if a provider was already registered in this
    // process; the node still runs, its metrics just aren't exported.
    if let Err(err) = initialize_metrics() {
        tracing::warn!("Metrics are not exported: {err}");
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .thread_name("millwheel-node")
        .enable_all()
        .build()
        .map_err(|err| EngineError::Internal(format!("error starting node runtime: {err}")))?;

    let port = config.status_api_port;
    rt.block_on(async move {
        let (node, events) = build(config)?;
        tracing::info!("Running node {}", node.holder());

        let server = webserver::enabled().then(|| {
            let source = Arc::new(node.clone());
            tokio::spawn(async move {
                if let Err(err) = webserver::run_webserver(source, port).await {
                    tracing::error!("{err}");
                }
            })
        });

        let res = main(node, events).await;
        if let Some(server) = server {
            server.abort();
        }
        res
    })
}

#[test]
fn runs_a_node_with_its_services() {
    use crate::fencing::HolderId;
    use crate::fencing::KeyRange;
    use crate::node::CountLogic;
    use crate::node::Discard;
    use crate::node::Outcome;
    use crate::record::Record;
    use crate::store::InMemStore;
    use crate::store::SequenceNumber;

    let mut config = EngineConfig::default();
    config.log_level = "warn".to_owned();
    let store = Arc::new(InMemStore::new());

    let outcome = run_main(
        config,
        None,
        |config| {
            ComputationNode::new(
                HolderId::from("node1"),
                CountLogic,
                store.clone(),
                Arc::new(Discard),
                config,
            )
        },
        |node, _events| async move {
            node.acquire(KeyRange::full()).await?;
            node.process(Record::new("x", "a")).await
        },
    )
    .unwrap();
    assert_eq!(outcome, Outcome::Committed(SequenceNumber(1)));

    let err = run_main(
        EngineConfig {
            log_level: "loud".to_owned(),
            ..Default::default()
        },
        None,
        |config| {
            ComputationNode::new(
                HolderId::from("node2"),
                CountLogic,
                Arc::new(InMemStore::new()),
                Arc::new(Discard),
                config,
            )
        },
        |_, _| async { Ok(()) },
    )
    .unwrap_err();
    assert!(matches!(err, EngineError::Config(_)), "{err}");
}
