//! HTTP control surface for the engine.
//!
//! Provides REST API endpoints for:
//! - Health checks
//! - Starting diagnosis sessions from observed symptoms
//! - Querying session snapshots
//! - Recording approvals and cancellations

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use medic_engine::{Actor, Engine, SessionError, StructuredSignal, SymptomSet};

/// Server state shared across handlers.
pub struct ServerState {
    /// The engine driving all sessions
    pub engine: Engine,
}

/// Build the HTTP router.
pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/sessions", post(start_session_handler))
        .route("/api/sessions/{id}", get(session_status_handler))
        .route("/api/sessions/{id}/approve", post(approve_handler))
        .route("/api/sessions/{id}/cancel", post(cancel_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
///
/// # Errors
///
/// Returns an error if the server fails to bind or serve.
pub async fn run_server(state: Arc<ServerState>, addr: &str) -> Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("medicd control surface listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

// ============================================================================
// Request/Response types
// ============================================================================

/// Health check response.
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Symptoms to open a session for.
#[derive(Debug, Deserialize)]
pub struct StartSessionRequest {
    /// Free-form symptom tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// Structured signal descriptors
    #[serde(default)]
    pub signals: Vec<StructuredSignal>,
}

/// New session id.
#[derive(Debug, Serialize)]
struct StartSessionResponse {
    session_id: Uuid,
}

/// Approval for a pending action.
#[derive(Debug, Deserialize)]
pub struct ApproveRequest {
    /// Action the approval targets
    pub action_id: String,
    /// Approving operator identity
    pub actor: String,
}

/// Session cancellation.
#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    /// Cancelling operator identity
    pub actor: String,
}

/// Error body for non-2xx responses.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(err: &SessionError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match err {
        SessionError::UnknownSession(_) => StatusCode::NOT_FOUND,
        SessionError::Archived(_) | SessionError::NoPendingApproval { .. } => StatusCode::CONFLICT,
        SessionError::Closed(_) => StatusCode::GONE,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn start_session_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<StartSessionRequest>,
) -> impl IntoResponse {
    let session_id = state
        .engine
        .start_session(SymptomSet {
            tags: request.tags,
            signals: request.signals,
        })
        .await;
    (
        StatusCode::ACCEPTED,
        Json(StartSessionResponse { session_id }),
    )
}

async fn session_status_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.engine.get_status(id).await {
        Ok(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        Err(err) => error_response(&err).into_response(),
    }
}

async fn approve_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<ApproveRequest>,
) -> impl IntoResponse {
    match state
        .engine
        .approve_action(id, &request.action_id, Actor::operator(request.actor))
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(&err).into_response(),
    }
}

async fn cancel_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<CancelRequest>,
) -> impl IntoResponse {
    match state.engine.cancel(id, Actor::operator(request.actor)).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(&err).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_request_defaults() {
        let request: StartSessionRequest = serde_json::from_str("{}").unwrap();
        assert!(request.tags.is_empty());
        assert!(request.signals.is_empty());

        let request: StartSessionRequest = serde_json::from_str(
            r#"{"tags": ["high_latency"], "signals": [{"field": "service", "value": "backend"}]}"#,
        )
        .unwrap();
        assert_eq!(request.tags, vec!["high_latency".to_string()]);
        assert_eq!(request.signals[0].field, "service");
    }

    #[test]
    fn test_error_status_mapping() {
        let id = Uuid::nil();
        let (status, _) = error_response(&SessionError::UnknownSession(id));
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = error_response(&SessionError::Archived(id));
        assert_eq!(status, StatusCode::CONFLICT);
        let (status, _) = error_response(&SessionError::Closed(id));
        assert_eq!(status, StatusCode::GONE);
    }
}
