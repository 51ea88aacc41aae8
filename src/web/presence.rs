use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use tokio::sync::broadcast::error::RecvError;

use super::*;
use helpdock_core::types::VisitorInfo;

/// Messages a widget sends over its presence socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum PresenceMessage {
    Join {
        room: String,
        #[serde(flatten)]
        info: VisitorInfo,
    },
    Heartbeat {
        room: String,
    },
    Leave {
        room: String,
    },
}

#[derive(Debug, Deserialize)]
pub(super) struct OnlineQuery {
    chatbot_id: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct DashboardQuery {
    chatbot_id: String,
    #[serde(default)]
    token: Option<String>,
}

/// Widget-side presence socket. Join/heartbeat/leave messages drive the
/// registry; a dropped socket counts as a leave for the joined room.
pub(super) async fn ws_visitor(
    State(state): State<WebState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| visitor_socket(state, socket))
}

async fn visitor_socket(state: WebState, mut socket: WebSocket) {
    let presence = &state.app_state.presence;
    let mut joined_room: Option<String> = None;

    while let Some(message) = socket.recv().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let parsed: PresenceMessage = match serde_json::from_str(&text) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(target: "web", "Ignoring malformed presence message: {e}");
                continue;
            }
        };
        if let Err(e) = apply_presence_message(presence, &mut joined_room, parsed).await {
            error!(target: "web", "Presence update failed: {e}");
        }
    }

    if let Some(room) = joined_room {
        if let Err(e) = presence.leave(&room).await {
            error!(target: "web", room = %room, "Leave on disconnect failed: {e}");
        }
    }
}

/// One presence message against the registry. A socket tracks at most one
/// joined room: re-joining under a different room leaves the old one first,
/// so it never lingers online until the staleness sweep.
async fn apply_presence_message(
    presence: &crate::presence::PresenceRegistry,
    joined_room: &mut Option<String>,
    message: PresenceMessage,
) -> Result<(), helpdock_core::error::HelpDockError> {
    match message {
        PresenceMessage::Join { room, info } => {
            if let Some(previous) = joined_room.take() {
                if previous != room {
                    presence.leave(&previous).await?;
                }
            }
            *joined_room = Some(room.clone());
            presence.join(&room, info).await
        }
        PresenceMessage::Heartbeat { room } => presence.heartbeat(&room).await,
        PresenceMessage::Leave { room } => {
            if joined_room.as_deref() == Some(room.as_str()) {
                *joined_room = None;
            }
            presence.leave(&room).await
        }
    }
}

/// Dashboard socket: pushes the online visitor list for one chatbot on every
/// presence change. Browsers cannot set headers on websocket upgrades, so the
/// token rides in the query string.
pub(super) async fn ws_dashboard(
    State(state): State<WebState>,
    Query(query): Query<DashboardQuery>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    super::require_token(&state, query.token.clone())?;
    Ok(ws.on_upgrade(move |socket| dashboard_socket(state, query.chatbot_id, socket)))
}

async fn dashboard_socket(state: WebState, chatbot_id: String, mut socket: WebSocket) {
    let presence = state.app_state.presence.clone();
    let mut changes = presence.subscribe();

    if push_online_list(&state, &chatbot_id, &mut socket).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            change = changes.recv() => {
                match change {
                    Ok(change) => {
                        let relevant = change
                            .chatbot_id
                            .as_ref()
                            .map_or(true, |id| id == &chatbot_id);
                        if !relevant {
                            continue;
                        }
                    }
                    // Missed some updates; the refreshed list below covers
                    // whatever was dropped.
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
                if push_online_list(&state, &chatbot_id, &mut socket).await.is_err() {
                    break;
                }
            }
            message = socket.recv() => {
                match message {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                }
            }
        }
    }
}

async fn push_online_list(
    state: &WebState,
    chatbot_id: &str,
    socket: &mut WebSocket,
) -> Result<(), ()> {
    let online = match state.app_state.presence.list_online(chatbot_id).await {
        Ok(online) => online,
        Err(e) => {
            error!(target: "web", "Online list fetch failed: {e}");
            return Ok(());
        }
    };
    let payload = json!({ "type": "online_visitors", "visitors": online });
    let text = match serde_json::to_string(&payload) {
        Ok(text) => text,
        Err(e) => {
            error!(target: "web", "Online list serialization failed: {e}");
            return Ok(());
        }
    };
    socket.send(Message::Text(text.into())).await.map_err(|_| ())
}

/// One-shot online list for dashboards that poll instead of streaming.
pub(super) async fn api_visitors_online(
    State(state): State<WebState>,
    headers: HeaderMap,
    Query(query): Query<OnlineQuery>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    super::require_token(&state, super::auth_token_from_headers(&headers))?;
    let online = state
        .app_state
        .presence
        .list_online(&query.chatbot_id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(json!({ "visitors": online })))
}
