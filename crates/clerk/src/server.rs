//! Network transport: one endpoint for JSON-RPC calls behind the admission
//! gate, one for webhook deliveries, and unauthenticated liveness and
//! manifest endpoints. Protocol-level failures are reported inside the
//! JSON-RPC envelope with HTTP 200; only transport-level faults surface
//! other statuses.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use axum_extra::headers::authorization::Bearer;
use axum_extra::headers::Authorization;
use axum_extra::TypedHeader;
use serde_json::{json, Value};

use crate::admission::{Denial, Gate};
use crate::webhook::{Outcome, Rejection, WebhookRouter, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use crate::{rpc, App};

#[derive(Clone)]
pub struct ServerState {
    pub app: Arc<App>,
    pub gate: Arc<Gate>,
    pub webhook: Option<Arc<WebhookRouter>>,
    /// End-to-end bound on one request.
    pub request_timeout: Duration,
}

pub fn build_router(state: ServerState) -> axum::Router {
    axum::Router::new()
        .route("/rpc", post(handle_rpc))
        .route("/webhook", post(handle_webhook))
        .route("/healthz", get(handle_health))
        .route("/manifest", get(handle_manifest))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

#[tracing::instrument(skip_all, fields(peer = %addr))]
async fn handle_rpc(
    State(state): State<ServerState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    // Absent or non-bearer Authorization headers both land as None; the
    // gate rejects either as unauthorised.
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    body: bytes::Bytes,
) -> Response {
    let token = bearer.as_ref().map(|TypedHeader(auth)| auth.token());

    // Admission precedes parsing; a denied caller learns nothing about how
    // the body would have fared.
    let principal = match state.gate.admit(token, addr.ip()).await {
        Ok(principal) => principal,
        Err(denial) => {
            return (StatusCode::OK, Json(denial_response(denial))).into_response();
        }
    };
    tracing::debug!(subject = %principal.subject, "admitted");

    let raw = String::from_utf8_lossy(&body);
    let envelope = match rpc::parse(&raw) {
        Ok(envelope) => envelope,
        Err(response) => return (StatusCode::OK, Json(response)).into_response(),
    };
    let id = envelope.id.clone();

    match tokio::time::timeout(state.request_timeout, rpc::handle(&state.app, envelope)).await {
        Ok(Some(response)) => (StatusCode::OK, Json(response)).into_response(),
        // Notifications produce no response body.
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(_) => match id {
            Some(id) => (
                StatusCode::OK,
                Json(rpc::error_response(id, rpc::RpcError::timeout(None))),
            )
                .into_response(),
            None => StatusCode::NO_CONTENT.into_response(),
        },
    }
}

fn denial_response(denial: Denial) -> Value {
    let err = match denial {
        Denial::Unauthorized(message) => rpc::RpcError::new(rpc::code::UNAUTHORIZED, message),
        Denial::Forbidden(message) => rpc::RpcError::new(rpc::code::FORBIDDEN, message),
        Denial::RateLimited { retry_after } => {
            let mut err = rpc::RpcError::new(rpc::code::RATE_LIMITED, "rate limit exceeded");
            err.data = Some(json!({ "retry-after-seconds": retry_after.as_secs() }));
            err
        }
    };
    rpc::error_response(Value::Null, err)
}

async fn handle_webhook(
    State(state): State<ServerState>,
    headers: HeaderMap,
    body: bytes::Bytes,
) -> Response {
    let Some(webhook) = &state.webhook else {
        return (StatusCode::NOT_FOUND, "webhook ingestion is not enabled").into_response();
    };

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    let timestamp = headers
        .get(TIMESTAMP_HEADER)
        .and_then(|value| value.to_str().ok());

    match webhook.deliver(signature, timestamp, &body).await {
        Ok(Outcome::Accepted { handled }) => {
            (StatusCode::OK, Json(json!({ "status": "ok", "handled": handled }))).into_response()
        }
        Ok(Outcome::Duplicate) => {
            (StatusCode::OK, Json(json!({ "status": "duplicate" }))).into_response()
        }
        Err(Rejection::BadSignature(reason)) => {
            tracing::warn!(reason, "rejecting webhook delivery");
            (StatusCode::UNAUTHORIZED, reason).into_response()
        }
        Err(Rejection::BadPayload(reason)) => {
            // A body that verified but cannot be decoded is a framework-level
            // fault; 5xx invites redelivery, unlike handler failures.
            tracing::error!(%reason, "failed to decode a verified webhook delivery");
            (StatusCode::INTERNAL_SERVER_ERROR, reason).into_response()
        }
    }
}

async fn handle_health(State(state): State<ServerState>) -> Response {
    let (kv, token, upstream) = tokio::join!(
        async { state.app.kv.ping().await.is_ok() },
        state.app.tokens.has_fresh_credential(),
        state.app.client.reachable(),
    );

    let status = if kv && token && upstream { "ok" } else { "degraded" };
    Json(json!({
        "status": status,
        "checks": { "kv": kv, "upstream-token": token, "upstream-api": upstream },
    }))
    .into_response()
}

async fn handle_manifest() -> Response {
    Json(crate::registry::manifest()).into_response()
}
