use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::runtime::AppState;

mod campaigns;
mod chat;
mod presence;

#[derive(Clone)]
pub(crate) struct WebState {
    app_state: Arc<AppState>,
}

pub async fn start_web_server(app_state: Arc<AppState>) {
    let addr = format!(
        "{}:{}",
        app_state.config.web_host, app_state.config.web_port
    );
    let router = build_router(WebState { app_state });

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(target: "web", "Failed to bind {addr}: {e}");
            return;
        }
    };
    info!(target: "web", "Listening on {addr}");
    if let Err(e) = axum::serve(listener, router).await {
        error!(target: "web", "Server error: {e}");
    }
}

pub(crate) fn build_router(state: WebState) -> Router {
    Router::new()
        .route("/api/health", get(api_health))
        .route("/api/chat/send", post(chat::api_chat_send))
        .route("/api/chat/agent", post(chat::api_chat_agent))
        .route("/api/chat/close", post(chat::api_chat_close))
        .route("/api/chat/review", post(chat::api_chat_review))
        .route("/api/chat/history", get(chat::api_chat_history))
        .route("/ws/visitor", get(presence::ws_visitor))
        .route("/ws/dashboard", get(presence::ws_dashboard))
        .route("/api/visitors/online", get(presence::api_visitors_online))
        .route(
            "/api/campaigns",
            put(campaigns::api_put_campaign).get(campaigns::api_list_campaigns),
        )
        .route("/api/campaigns/decide", post(campaigns::api_campaign_decide))
        .route("/api/campaigns/event", post(campaigns::api_campaign_event))
        .with_state(state)
}

async fn api_health() -> Json<serde_json::Value> {
    Json(json!({ "ok": true }))
}

pub(super) fn auth_token_from_headers(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get("authorization")?.to_str().ok()?.trim();
    let mut parts = raw.splitn(2, char::is_whitespace);
    let scheme = parts.next()?.trim();
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = parts.next()?.trim();
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

/// Dashboard/admin routes require the configured token when one is set.
pub(crate) fn require_token(
    state: &WebState,
    presented: Option<String>,
) -> Result<(), (StatusCode, String)> {
    let Some(expected) = &state.app_state.config.web_auth_token else {
        return Ok(());
    };
    match presented {
        Some(token) if &token == expected => Ok(()),
        _ => Err((StatusCode::UNAUTHORIZED, "invalid or missing token".into())),
    }
}
