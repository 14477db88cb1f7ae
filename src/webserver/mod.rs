//! HTTP status API of a node.
//!
//! `/status` describes the ranges the node owns and the phase of each
//! of its keys as JSON; `/metrics` is the Prometheus scrape endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::Extension;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::Router;

use crate::errors::EngineError;
use crate::node::StatusSource;

struct State {
    source: Arc<dyn StatusSource>,
}

/// Whether the status API should be started, from
/// `MILLWHEEL_STATUS_API_ENABLED`.
pub fn enabled() -> bool {
    std::env::var("MILLWHEEL_STATUS_API_ENABLED")
        .map(|var| matches!(var.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

pub(crate) fn router(source: Arc<dyn StatusSource>) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/metrics", get(get_metrics))
        .layer(Extension(Arc::new(State { source })))
}

/// Serve the status API until the future is dropped.
pub async fn run_webserver(source: Arc<dyn StatusSource>, port: u16) -> Result<(), EngineError> {
    let app = router(source);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Starting status API server on {addr:?}");

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
        .map_err(|err| {
            EngineError::Internal(format!("Unable to run status API server at port {port}: {err}"))
        })
}

fn json_response(status: StatusCode, body: String) -> Response {
    (status, [("content-type", "application/json")], body).into_response()
}

async fn get_status(Extension(state): Extension<Arc<State>>) -> Response {
    match serde_json::to_string(&state.source.status()) {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(err) => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "error": err.to_string() }).to_string(),
        ),
    }
}

async fn get_metrics() -> Response {
    match crate::metrics::render() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

#[cfg(test)]
struct FixedStatus;

#[cfg(test)]
impl StatusSource for FixedStatus {
    fn status(&self) -> crate::node::NodeStatus {
        crate::node::NodeStatus {
            holder: crate::fencing::HolderId::from("node1"),
            ranges: vec![crate::node::RangeStatus {
                range: crate::fencing::KeyRange::full().to_string(),
                epoch: crate::fencing::Epoch(3),
            }],
            keys: Vec::new(),
        }
    }
}

#[tokio::test]
async fn status_is_served_as_json() {
    use axum::body::HttpBody;

    let response = get_status(Extension(Arc::new(State {
        source: Arc::new(FixedStatus),
    })))
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "application/json");

    let mut body = response.into_body();
    let mut bytes = Vec::new();
    while let Some(chunk) = body.data().await {
        bytes.extend_from_slice(&chunk.unwrap());
    }
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["holder"], "node1");
    assert_eq!(json["ranges"][0]["epoch"], 3);
}

#[tokio::test]
async fn metrics_endpoint_answers() {
    let response = get_metrics().await;
    assert_eq!(response.status(), StatusCode::OK);
}
