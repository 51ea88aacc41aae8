use std::convert::Infallible;

use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::Response;
use futures_util::StreamExt;

use super::*;
use crate::assistant::StreamChatRequest;
use crate::session::{CloseReason, SessionState};
use crate::stream::StreamEvent;
use helpdock_core::error::HelpDockError;
use helpdock_core::types::{Review, Role};
use helpdock_storage::db::call_blocking;

#[derive(Debug, Deserialize)]
pub(super) struct ChatSendRequest {
    conversation_id: String,
    visitor_id: String,
    chatbot_id: String,
    prompt: String,
    #[serde(default)]
    visitor_email: Option<String>,
    #[serde(default)]
    plan_flags: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub(super) struct ConversationRef {
    conversation_id: String,
    #[serde(default)]
    chatbot_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(super) struct ReviewRequest {
    conversation_id: String,
    rating: u8,
    #[serde(default)]
    review_data: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(super) struct HistoryQuery {
    conversation_id: String,
}

fn map_session_error(e: HelpDockError) -> (StatusCode, String) {
    match e {
        HelpDockError::SessionClosed(_) => (StatusCode::CONFLICT, e.to_string()),
        HelpDockError::ReviewAlreadySubmitted(_) => (StatusCode::CONFLICT, e.to_string()),
        HelpDockError::NotFound(_) => (StatusCode::NOT_FOUND, e.to_string()),
        other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
    }
}

/// Visitor message in, assistant tokens out as server-sent events. While the
/// conversation awaits a live agent the message is recorded but nothing
/// streams back.
pub(super) async fn api_chat_send(
    State(state): State<WebState>,
    Json(req): Json<ChatSendRequest>,
) -> Result<Response, (StatusCode, String)> {
    let app = state.app_state;

    // A closed conversation may already have been dropped from the hub;
    // its persisted record still makes it terminal.
    if app.sessions.state(&req.conversation_id).await.is_none() {
        let conversation_id = req.conversation_id.clone();
        let stored = call_blocking(app.db.clone(), move |db| {
            db.get_conversation(&conversation_id)
        })
        .await
        .map_err(map_session_error)?;
        if stored.is_some() {
            return Err((
                StatusCode::CONFLICT,
                format!("Conversation {} is closed", req.conversation_id),
            ));
        }
    }

    let session_state = app
        .sessions
        .open(&req.conversation_id, &req.visitor_id, &req.chatbot_id)
        .await;
    if session_state == SessionState::Closed {
        return Err((
            StatusCode::CONFLICT,
            format!("Conversation {} is closed", req.conversation_id),
        ));
    }

    app.sessions
        .record_message(&req.conversation_id, Role::Visitor, &req.prompt)
        .await
        .map_err(map_session_error)?;

    if session_state == SessionState::AwaitingAgent {
        return Ok(Json(json!({ "ok": true, "state": "awaiting_agent" })).into_response());
    }

    let request = StreamChatRequest {
        visitor_id: req.visitor_id.clone(),
        visitor_email: req.visitor_email.clone(),
        chatbot_id: req.chatbot_id.clone(),
        conversation_id: req.conversation_id.clone(),
        prompt: req.prompt.clone(),
        plan_flags: req.plan_flags.clone(),
    };
    let upstream = app
        .assistant
        .stream_chat(&request)
        .await
        .map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))?;

    let sessions = app.sessions.clone();
    let conversation_id = req.conversation_id;
    let sse_stream = async_stream::stream! {
        futures_util::pin_mut!(upstream);
        let mut reply = String::new();
        while let Some(event) = upstream.next().await {
            match event {
                StreamEvent::Token(token) => {
                    reply.push_str(&token);
                    yield Ok::<_, Infallible>(Event::default().event("token").data(token));
                }
                StreamEvent::Complete(meta) => {
                    if !reply.is_empty() {
                        if let Err(e) = sessions
                            .record_message(&conversation_id, Role::Assistant, &reply)
                            .await
                        {
                            // Closed mid-stream (idle sweep, explicit close);
                            // the transcript stays as it was at close time.
                            warn!(
                                target: "web",
                                conversation_id = %conversation_id,
                                "Assistant reply not recorded: {e}"
                            );
                        }
                    }
                    yield Ok(Event::default().event("complete").data(meta.to_string()));
                }
                StreamEvent::Error(failure) => {
                    // The conversation stays open; the visitor can retry.
                    yield Ok(Event::default().event("error").data(failure.to_string()));
                }
            }
        }
    };
    Ok(Sse::new(sse_stream)
        .keep_alive(KeepAlive::default())
        .into_response())
}

/// Escalate to a live agent. The response carries whichever online agent
/// room the presence registry offered, or null when nobody is available.
pub(super) async fn api_chat_agent(
    State(state): State<WebState>,
    Json(req): Json<ConversationRef>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let app = state.app_state;
    let agent_room = match &req.chatbot_id {
        Some(chatbot_id) => app
            .presence
            .find_available_agent(chatbot_id)
            .await
            .map_err(map_session_error)?,
        None => None,
    };
    app.sessions
        .request_agent(&req.conversation_id, agent_room.clone())
        .await
        .map_err(map_session_error)?;
    Ok(Json(json!({ "ok": true, "agent_room": agent_room })))
}

/// Explicit close. Idempotent: re-closing is a no-op that still answers ok.
pub(super) async fn api_chat_close(
    State(state): State<WebState>,
    Json(req): Json<ConversationRef>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let app = &state.app_state;
    let snapshot = app
        .sessions
        .close(&req.conversation_id, CloseReason::Explicit)
        .await;
    let newly_closed = snapshot.is_some();
    if let Some(closed) = snapshot {
        persist_closed(&state, closed).await?;
    }
    Ok(Json(json!({ "ok": true, "closed": newly_closed })))
}

/// Review submission closes the conversation and attaches the rating. A
/// conversation takes exactly one review; repeats answer 409.
pub(super) async fn api_chat_review(
    State(state): State<WebState>,
    Json(req): Json<ReviewRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    if !(1..=5).contains(&req.rating) {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            "rating must be between 1 and 5".into(),
        ));
    }
    let app = &state.app_state;
    if let Some(closed) = app
        .sessions
        .close(&req.conversation_id, CloseReason::Review)
        .await
    {
        persist_closed(&state, closed).await?;
    }

    let review = Review {
        rating: req.rating,
        review_data: req.review_data,
    };
    let conversation_id = req.conversation_id.clone();
    call_blocking(app.db.clone(), move |db| {
        db.attach_review(&conversation_id, &review)
    })
    .await
    .map_err(map_session_error)?;
    info!(
        target: "web",
        conversation_id = %req.conversation_id,
        rating = req.rating,
        "Review recorded"
    );
    Ok(Json(json!({ "ok": true })))
}

/// Transcript lookup: the live hub first, then persisted conversations.
pub(super) async fn api_chat_history(
    State(state): State<WebState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let app = state.app_state;
    if let Some(history) = app.sessions.history(&query.conversation_id).await {
        return Ok(Json(json!({
            "conversation_id": query.conversation_id,
            "messages": history,
        })));
    }

    let conversation_id = query.conversation_id.clone();
    let stored = call_blocking(app.db.clone(), move |db| {
        let Some(conversation) = db.get_conversation(&conversation_id)? else {
            return Ok(None);
        };
        let messages = db.get_conversation_messages(&conversation_id)?;
        Ok(Some((conversation, messages)))
    })
    .await
    .map_err(map_session_error)?;

    match stored {
        Some((conversation, messages)) => Ok(Json(json!({
            "conversation_id": query.conversation_id,
            "close_reason": conversation.close_reason,
            "closed_at": conversation.closed_at,
            "messages": messages,
        }))),
        None => Err((
            StatusCode::NOT_FOUND,
            format!("conversation {} not found", query.conversation_id),
        )),
    }
}

async fn persist_closed(
    state: &WebState,
    closed: crate::session::ClosedConversation,
) -> Result<(), (StatusCode, String)> {
    let closed_at = chrono::Utc::now().to_rfc3339();
    call_blocking(state.app_state.db.clone(), move |db| {
        db.store_closed_conversation(
            &closed.conversation_id,
            &closed.visitor_id,
            &closed.chatbot_id,
            closed.close_reason.as_str(),
            &closed_at,
            &closed.history,
        )
    })
    .await
    .map_err(map_session_error)
}
