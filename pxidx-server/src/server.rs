//! Axum server setup and router configuration.

use crate::shutdown::wait_for_shutdown;
use crate::state::AppState;
use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use pxidx_core::processors::{IngestionState, IngestionStatus};
use serde::Serialize;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Build the main application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status))
        .with_state(state)
}

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Simple health check - returns OK if the server is running.
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Status response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    #[serde(flatten)]
    ingestion: IngestionStatus,
    cached_markets: usize,
    cached_vaults: usize,
}

/// Ingestion progress. Answers 503 once ingestion has halted.
async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let ingestion = state.status();
    let code = match ingestion.state {
        IngestionState::Halted { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    let response = StatusResponse {
        ingestion,
        cached_markets: state.caches.market_count().await,
        cached_vaults: state.caches.vault_count().await,
    };
    (code, Json(response))
}

/// Run the server until `shutdown_rx` flips.
pub async fn run_server(
    router: Router,
    addr: SocketAddr,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(wait_for_shutdown(shutdown_rx))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::Response;
    use pxidx_core::caches::DerivedStateCaches;

    fn state(ingestion: IngestionStatus) -> (watch::Sender<IngestionStatus>, AppState) {
        let (tx, rx) = watch::channel(ingestion);
        (tx, AppState::new(rx, DerivedStateCaches::new().reader()))
    }

    #[tokio::test]
    async fn test_status_reports_progress() {
        let (tx, state) = state(IngestionStatus {
            last_committed_height: None,
            state: IngestionState::Running,
        });
        tx.send_replace(IngestionStatus {
            last_committed_height: Some(41),
            state: IngestionState::Running,
        });

        let response: Response = status(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["lastCommittedHeight"], 41);
        assert_eq!(json["state"], "running");
        assert_eq!(json["cachedMarkets"], 0);
    }

    #[tokio::test]
    async fn test_halted_status_is_unavailable() {
        let (_tx, state) = state(IngestionStatus {
            last_committed_height: Some(7),
            state: IngestionState::Halted {
                reason: "block 8 failed".to_string(),
            },
        });
        let response = status(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
