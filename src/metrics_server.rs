//! Minimal axum server exposing the `AmiMetrics` registry at `/metrics`. Entirely ambient: the
//! streaming engine works without ever calling this.

#![cfg(feature = "metrics")]

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;

use crate::error::{AmiError, AmiResult};
use crate::metrics::AmiMetrics;

#[derive(Clone)]
struct ServerState {
    metrics: Arc<AmiMetrics>,
}

/// Serves `GET /metrics` in Prometheus text exposition format until the process is killed or
/// the listener errors.
pub async fn run_metrics_server(bind_addr: &str, port: u16, metrics: Arc<AmiMetrics>) -> AmiResult<()> {
    let addr: SocketAddr = format!("{bind_addr}:{port}")
        .parse()
        .map_err(|e| AmiError::InvalidConfig(format!("invalid metrics bind address: {e}")))?;

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(ServerState { metrics });

    tracing::info!(%addr, "ami metrics server starting");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| AmiError::Internal(format!("failed to bind metrics server: {e}")))?;

    axum::serve(listener, app)
        .await
        .map_err(|e| AmiError::Internal(format!("metrics server error: {e}")))?;

    Ok(())
}

async fn metrics_handler(State(state): State<ServerState>) -> impl IntoResponse {
    match state.metrics.gather_text() {
        Ok(text) => {
            let mut headers = HeaderMap::new();
            headers.insert(
                axum::http::header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8".parse().unwrap(),
            );
            (StatusCode::OK, headers, text).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to gather ami metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "gather metrics failed\n").into_response()
        }
    }
}
