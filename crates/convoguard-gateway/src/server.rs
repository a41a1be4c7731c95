use crate::middleware::{auth_middleware, AuthConfig};
use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    middleware as axum_mw,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use convoguard_channels::CircuitStatus;
use convoguard_core::{ConvoError, InboundEvent, SessionKey};
use convoguard_orchestrator::{InboundDispatcher, SessionOrchestrator, SubmitError};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

/// Shared application state.
pub struct AppState {
    /// Handles operator and privacy requests directly.
    pub orchestrator: Arc<SessionOrchestrator>,
    /// Queue for conversation events.
    pub inbound: InboundDispatcher,
}

/// The HTTP ingress.
pub struct GatewayServer;

impl GatewayServer {
    /// Build the router. `/health` is public; everything under `/v1` goes
    /// through the auth middleware when keys are configured.
    pub fn build(
        orchestrator: Arc<SessionOrchestrator>,
        inbound: InboundDispatcher,
        auth: AuthConfig,
    ) -> Router {
        let state = Arc::new(AppState {
            orchestrator,
            inbound,
        });

        let api = Router::new()
            .route("/v1/events", post(submit_event))
            .route("/v1/sessions/{key}", get(inspect_session))
            .route("/v1/sessions/{key}/deletion", post(request_deletion))
            .route("/v1/deletions/{id}", delete(cancel_deletion))
            .route_layer(axum_mw::from_fn_with_state(Arc::new(auth), auth_middleware));

        Router::new()
            .route("/health", get(health_handler))
            .merge(api)
            .with_state(state)
    }
}

fn error_response(err: &ConvoError) -> Response {
    let status = match err {
        ConvoError::StoreUnavailable(_) | ConvoError::Io(_) => StatusCode::SERVICE_UNAVAILABLE,
        ConvoError::Session(_) | ConvoError::Conflict(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let report = state.orchestrator.health().await;
    let status = if report.breaker.status == CircuitStatus::Closed {
        "ok"
    } else {
        "degraded"
    };
    Json(json!({
        "status": status,
        "service": "convoguard",
        "inbound_depth": state.inbound.depth(),
        "inbound_capacity": state.inbound.capacity(),
        "components": report,
    }))
}

async fn submit_event(
    State(state): State<Arc<AppState>>,
    Json(event): Json<InboundEvent>,
) -> Response {
    if event.sender_id.trim().is_empty() || event.conversation_id.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "sender_id and conversation_id are required" })),
        )
            .into_response();
    }
    match state.inbound.try_submit(event) {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({ "status": "accepted" }))).into_response(),
        Err(e) => {
            warn!(error = %e, depth = state.inbound.depth(), "Inbound event rejected");
            let retry_after = match e {
                SubmitError::Full => "1",
                SubmitError::Closed => "30",
            };
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [(header::RETRY_AFTER, retry_after)],
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn inspect_session(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Response {
    let Some(operator) = headers
        .get("x-operator")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
    else {
        return (StatusCode::BAD_REQUEST, "X-Operator header required").into_response();
    };
    match state.orchestrator.inspect(&SessionKey::new(key), operator).await {
        Ok(Some(session)) => Json(session).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            error!(error = %e, "Operator read failed");
            error_response(&e)
        }
    }
}

async fn request_deletion(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Response {
    match state.orchestrator.request_deletion(&SessionKey::new(key)).await {
        Ok(request) => (StatusCode::ACCEPTED, Json(request)).into_response(),
        Err(e) => {
            error!(error = %e, "Erasure request failed");
            error_response(&e)
        }
    }
}

async fn cancel_deletion(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    match state.orchestrator.cancel_deletion(id).await {
        Ok(request) => Json(request).into_response(),
        Err(e) => error_response(&e),
    }
}
