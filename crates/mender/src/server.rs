//! Thin webhook ingestion endpoint (§6) — one route, no dashboard, no
//! static files, intentionally minimal per the Non-goals. Wraps
//! [`mender_core::ingest_event`] for local development and manual testing;
//! any other transport (a queue consumer, the `replay` subcommand) calls
//! the same function directly.

use crate::config::AppConfig;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use mender_core::{ActiveRunRegistry, IngestionOutcome, PipelineContext};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

struct AppState {
    pipeline: Arc<PipelineContext>,
    registry: ActiveRunRegistry,
    webhook_secret: String,
    workspace_root: PathBuf,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum IngestResponse {
    Ingested { failure_id: i64 },
    Ignored { reason: String },
}

impl From<IngestionOutcome> for IngestResponse {
    fn from(outcome: IngestionOutcome) -> Self {
        match outcome {
            IngestionOutcome::Ingested { failure_id } => Self::Ingested { failure_id },
            IngestionOutcome::Ignored { reason } => Self::Ignored { reason },
        }
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let Some(signature) = headers
        .get("X-Hub-Signature-256")
        .and_then(|v| v.to_str().ok())
    else {
        return (StatusCode::UNAUTHORIZED, "missing X-Hub-Signature-256 header").into_response();
    };

    let event = match mender_core::webhook::parse_verified_event(
        state.webhook_secret.as_bytes(),
        &body,
        signature,
    ) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "rejected webhook payload");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    match mender_core::ingest_event(
        Arc::clone(&state.pipeline),
        &state.registry,
        &state.workspace_root,
        event,
    )
    .await
    {
        Ok(outcome) => {
            info!(?outcome, "ingested webhook event");
            (StatusCode::ACCEPTED, Json(IngestResponse::from(outcome))).into_response()
        }
        Err(e) => {
            error!(error = %e, "failed to persist ingested failure");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/webhooks/ci", post(webhook_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `config.listen_addr` and serve until the process is killed.
pub async fn serve(
    pipeline: Arc<PipelineContext>,
    config: &AppConfig,
    workspace_root: PathBuf,
) -> anyhow::Result<()> {
    let state = Arc::new(AppState {
        pipeline,
        registry: ActiveRunRegistry::new(),
        webhook_secret: config.webhook_secret.clone(),
        workspace_root,
    });
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "mender webhook server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
