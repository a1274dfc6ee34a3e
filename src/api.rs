//! HTTP facade.
//!
//! `GET /pair?number=...` and `GET /qr` each start one linking attempt and
//! answer with its login artifact. `GET /health` reports liveness.

use crate::linker::{Artifact, LinkError, Linker};
use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::get,
    Router,
};
use pairgate_core::config::ApiConfig;
use pairgate_core::link::LinkRequest;
use pairgate_core::phone::normalize_phone;
use serde::Deserialize;
use serde_json::{json, Value};
use std::future::Future;
use std::time::Instant;
use tracing::{info, warn};

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    linker: Linker,
    api_key: Option<String>,
    uptime: Instant,
}

impl ApiState {
    pub fn new(linker: Linker, config: &ApiConfig, uptime: Instant) -> Self {
        let api_key = if config.api_key.is_empty() {
            None
        } else {
            Some(config.api_key.clone())
        };
        Self {
            linker,
            api_key,
            uptime,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PairQuery {
    number: Option<String>,
}

/// Check bearer token auth. Returns `None` if authorized, `Some(response)` if rejected.
fn check_auth(headers: &HeaderMap, api_key: &Option<String>) -> Option<(StatusCode, Json<Value>)> {
    let key = api_key.as_ref()?;

    let Some(header) = headers.get("authorization") else {
        return Some((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "missing Authorization header"})),
        ));
    };

    let Ok(value) = header.to_str() else {
        return Some((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "invalid Authorization header"})),
        ));
    };

    match value.strip_prefix("Bearer ") {
        Some(token) if token == key => None,
        _ => Some((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "invalid token"})),
        )),
    }
}

/// Error body. Link errors always answer with `{code: <message>}`.
fn link_error(err: LinkError) -> (StatusCode, Json<Value>) {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        warn!("link request failed: {err}");
    }
    (status, Json(json!({"code": err.message()})))
}

/// `GET /health`
async fn health(headers: HeaderMap, State(state): State<ApiState>) -> ApiResult {
    if let Some(err) = check_auth(&headers, &state.api_key) {
        return Err(err);
    }

    Ok(Json(json!({
        "status": "OK",
        "uptime_secs": state.uptime.elapsed().as_secs(),
        "active_attempts": state.linker.active_attempts().await,
    })))
}

/// `GET /pair?number=<digits>` — link by pairing code.
async fn pair(
    headers: HeaderMap,
    State(state): State<ApiState>,
    Query(query): Query<PairQuery>,
) -> ApiResult {
    if let Some(err) = check_auth(&headers, &state.api_key) {
        return Err(err);
    }

    let raw = query
        .number
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| link_error(LinkError::Validation("Phone number is required".into())))?;
    let number =
        normalize_phone(&raw).map_err(|e| link_error(LinkError::Validation(validation_text(e))))?;

    match state.linker.start(LinkRequest::pair(number)).await {
        Ok(Artifact::PairingCode(code)) => Ok(Json(json!({ "code": code }))),
        Ok(Artifact::Qr { .. }) => Err(link_error(LinkError::Internal(
            "pair attempt produced a QR".into(),
        ))),
        Err(e) => Err(link_error(e)),
    }
}

/// `GET /qr` — link by QR scan.
async fn qr(headers: HeaderMap, State(state): State<ApiState>) -> ApiResult {
    if let Some(err) = check_auth(&headers, &state.api_key) {
        return Err(err);
    }

    match state.linker.start(LinkRequest::qr()).await {
        Ok(Artifact::Qr { data_url, .. }) => Ok(Json(json!({
            "qr": data_url,
            "message": "Scan QR code with WhatsApp",
            "instructions": [
                "Open WhatsApp on your phone",
                "Go to Settings > Linked Devices",
                "Tap 'Link a Device'",
                "Scan the QR code above",
            ],
        }))),
        Ok(Artifact::PairingCode(_)) => Err(link_error(LinkError::Internal(
            "QR attempt produced a pairing code".into(),
        ))),
        Err(e) => Err(link_error(e)),
    }
}

/// Validation failures carry their client-facing hint without the error prefix.
fn validation_text(err: pairgate_core::error::PairgateError) -> String {
    match err {
        pairgate_core::error::PairgateError::Validation(msg) => msg,
        other => other.to_string(),
    }
}

/// Build the axum router with shared state.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/pair", get(pair))
        .route("/qr", get(qr))
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve(
    config: &ApiConfig,
    linker: Linker,
    uptime: Instant,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = build_router(ApiState::new(linker, config, uptime));
    let addr = format!("{}:{}", config.host, config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind {addr}: {e}"))?;

    info!("API server listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
