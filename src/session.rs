use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use helpdock_core::error::HelpDockError;
use helpdock_core::types::{ChatMessage, Role};
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    AwaitingAgent,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    IdleTimeout,
    Explicit,
    Review,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::Explicit => "explicit",
            CloseReason::Review => "review",
        }
    }
}

/// How long a closed conversation lingers in the map before the sweep drops
/// it. Long enough for late close/review calls to observe the terminal
/// state; the persisted record outlives the entry.
const CLOSED_RETENTION_SECS: i64 = 60;

#[derive(Debug)]
struct ConversationSession {
    visitor_id: String,
    chatbot_id: String,
    history: Vec<ChatMessage>,
    state: SessionState,
    idle_deadline: DateTime<Utc>,
    agent_room: Option<String>,
    closed_at: Option<DateTime<Utc>>,
}

/// Frozen snapshot handed to the caller on the first close, for
/// persistence. Later closes of the same conversation return nothing.
#[derive(Debug, Clone)]
pub struct ClosedConversation {
    pub conversation_id: String,
    pub visitor_id: String,
    pub chatbot_id: String,
    pub close_reason: CloseReason,
    pub history: Vec<ChatMessage>,
}

/// Owns every live conversation. Closed sessions stay in the map as
/// tombstones so a terminal conversation can never be mutated again.
#[derive(Clone)]
pub struct SessionHub {
    sessions: Arc<Mutex<HashMap<String, ConversationSession>>>,
    idle_timeout: Duration,
}

impl SessionHub {
    pub fn new(idle_timeout_seconds: u64) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            idle_timeout: Duration::seconds(idle_timeout_seconds as i64),
        }
    }

    /// Create the session on first contact; refresh nothing otherwise.
    /// Returns the current state.
    pub async fn open(
        &self,
        conversation_id: &str,
        visitor_id: &str,
        chatbot_id: &str,
    ) -> SessionState {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .entry(conversation_id.to_string())
            .or_insert_with(|| {
                info!(
                    target: "session",
                    conversation_id = %conversation_id,
                    visitor_id = %visitor_id,
                    "Conversation opened"
                );
                ConversationSession {
                    visitor_id: visitor_id.to_string(),
                    chatbot_id: chatbot_id.to_string(),
                    history: Vec::new(),
                    state: SessionState::Active,
                    idle_deadline: Utc::now() + self.idle_timeout,
                    agent_room: None,
                    closed_at: None,
                }
            });
        session.state
    }

    pub async fn state(&self, conversation_id: &str) -> Option<SessionState> {
        let sessions = self.sessions.lock().await;
        sessions.get(conversation_id).map(|s| s.state)
    }

    pub async fn history(&self, conversation_id: &str) -> Option<Vec<ChatMessage>> {
        let sessions = self.sessions.lock().await;
        sessions.get(conversation_id).map(|s| s.history.clone())
    }

    /// Append a message and reset the idle deadline. Rejected once the
    /// conversation is closed.
    pub async fn record_message(
        &self,
        conversation_id: &str,
        role: Role,
        text: &str,
    ) -> Result<(), HelpDockError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(conversation_id)
            .ok_or_else(|| HelpDockError::NotFound(format!("conversation {conversation_id}")))?;
        if session.state == SessionState::Closed {
            return Err(HelpDockError::SessionClosed(conversation_id.to_string()));
        }
        session.history.push(ChatMessage {
            role,
            text: text.to_string(),
            timestamp: Utc::now(),
        });
        session.idle_deadline = Utc::now() + self.idle_timeout;
        Ok(())
    }

    /// Escalate to a live agent. No assistant streaming happens while the
    /// session awaits one. `agent_room` is whatever online agent the
    /// presence registry offered, if any.
    pub async fn request_agent(
        &self,
        conversation_id: &str,
        agent_room: Option<String>,
    ) -> Result<(), HelpDockError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(conversation_id)
            .ok_or_else(|| HelpDockError::NotFound(format!("conversation {conversation_id}")))?;
        if session.state == SessionState::Closed {
            return Err(HelpDockError::SessionClosed(conversation_id.to_string()));
        }
        session.state = SessionState::AwaitingAgent;
        session.agent_room = agent_room.clone();
        session.idle_deadline = Utc::now() + self.idle_timeout;
        info!(
            target: "session",
            conversation_id = %conversation_id,
            agent_room = ?agent_room,
            "Conversation escalated to live agent"
        );
        Ok(())
    }

    pub async fn assigned_agent(&self, conversation_id: &str) -> Option<String> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(conversation_id)
            .and_then(|s| s.agent_room.clone())
    }

    /// Close a conversation. Idempotent: closing an already-closed or
    /// unknown conversation is a no-op returning `None`.
    pub async fn close(
        &self,
        conversation_id: &str,
        reason: CloseReason,
    ) -> Option<ClosedConversation> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(conversation_id)?;
        if session.state == SessionState::Closed {
            return None;
        }
        session.state = SessionState::Closed;
        session.closed_at = Some(Utc::now());
        info!(
            target: "session",
            conversation_id = %conversation_id,
            reason = reason.as_str(),
            "Conversation closed"
        );
        Some(ClosedConversation {
            conversation_id: conversation_id.to_string(),
            visitor_id: session.visitor_id.clone(),
            chatbot_id: session.chatbot_id.clone(),
            close_reason: reason,
            history: session.history.clone(),
        })
    }

    /// Idle sweep, polled once per tick: any non-closed conversation whose
    /// deadline has passed transitions to Closed. Tombstones that have
    /// outlived their retention window are dropped; their history already
    /// lives in the store.
    pub async fn sweep_idle(&self, now: DateTime<Utc>) -> Vec<ClosedConversation> {
        let mut sessions = self.sessions.lock().await;
        let mut closed = Vec::new();
        for (conversation_id, session) in sessions.iter_mut() {
            if session.state == SessionState::Closed {
                continue;
            }
            if now < session.idle_deadline {
                continue;
            }
            session.state = SessionState::Closed;
            session.closed_at = Some(now);
            info!(
                target: "session",
                conversation_id = %conversation_id,
                "Conversation closed by idle timeout"
            );
            closed.push(ClosedConversation {
                conversation_id: conversation_id.clone(),
                visitor_id: session.visitor_id.clone(),
                chatbot_id: session.chatbot_id.clone(),
                close_reason: CloseReason::IdleTimeout,
                history: session.history.clone(),
            });
        }
        sessions.retain(|_, session| match session.closed_at {
            Some(at) => now < at + Duration::seconds(CLOSED_RETENTION_SECS),
            None => true,
        });
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_then_message_keeps_active() {
        let hub = SessionHub::new(900);
        assert_eq!(hub.open("c1", "v1", "bot1").await, SessionState::Active);
        hub.record_message("c1", Role::Visitor, "hello").await.unwrap();
        hub.record_message("c1", Role::Assistant, "hi!").await.unwrap();
        assert_eq!(hub.state("c1").await, Some(SessionState::Active));
        assert_eq!(hub.history("c1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_message_resets_idle_deadline() {
        let hub = SessionHub::new(900);
        hub.open("c1", "v1", "bot1").await;
        hub.record_message("c1", Role::Visitor, "hello").await.unwrap();

        // Just before the deadline nothing closes.
        let before = Utc::now() + Duration::seconds(899);
        assert!(hub.sweep_idle(before).await.is_empty());

        // Past the deadline the next sweep closes it.
        let after = Utc::now() + Duration::seconds(901);
        let closed = hub.sweep_idle(after).await;
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].close_reason, CloseReason::IdleTimeout);
        assert_eq!(hub.state("c1").await, Some(SessionState::Closed));
    }

    #[tokio::test]
    async fn test_closed_rejects_messages() {
        let hub = SessionHub::new(900);
        hub.open("c1", "v1", "bot1").await;
        hub.close("c1", CloseReason::Explicit).await.unwrap();

        let err = hub
            .record_message("c1", Role::Visitor, "anyone?")
            .await
            .unwrap_err();
        assert!(matches!(err, HelpDockError::SessionClosed(_)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let hub = SessionHub::new(900);
        hub.open("c1", "v1", "bot1").await;
        assert!(hub.close("c1", CloseReason::Explicit).await.is_some());
        assert!(hub.close("c1", CloseReason::Explicit).await.is_none());
        assert!(hub.close("ghost", CloseReason::Explicit).await.is_none());
    }

    #[tokio::test]
    async fn test_request_agent_transitions_state() {
        let hub = SessionHub::new(900);
        hub.open("c1", "v1", "bot1").await;
        hub.request_agent("c1", Some("agent-room-7".into()))
            .await
            .unwrap();
        assert_eq!(hub.state("c1").await, Some(SessionState::AwaitingAgent));
        assert_eq!(
            hub.assigned_agent("c1").await.as_deref(),
            Some("agent-room-7")
        );

        // Messages still flow to the transcript while awaiting an agent.
        hub.record_message("c1", Role::Visitor, "still here").await.unwrap();

        // And the same closing triggers apply.
        assert!(hub.close("c1", CloseReason::Explicit).await.is_some());
    }

    #[tokio::test]
    async fn test_awaiting_agent_times_out_too() {
        let hub = SessionHub::new(60);
        hub.open("c1", "v1", "bot1").await;
        hub.request_agent("c1", None).await.unwrap();

        let after = Utc::now() + Duration::seconds(61);
        let closed = hub.sweep_idle(after).await;
        assert_eq!(closed.len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_does_not_close_before_deadline() {
        let hub = SessionHub::new(900);
        hub.open("c1", "v1", "bot1").await;
        assert!(hub.sweep_idle(Utc::now()).await.is_empty());
        assert_eq!(hub.state("c1").await, Some(SessionState::Active));
    }

    #[tokio::test]
    async fn test_closed_snapshot_carries_history() {
        let hub = SessionHub::new(900);
        hub.open("c1", "v1", "bot1").await;
        hub.record_message("c1", Role::Visitor, "q").await.unwrap();
        hub.record_message("c1", Role::Assistant, "a").await.unwrap();

        let closed = hub.close("c1", CloseReason::Review).await.unwrap();
        assert_eq!(closed.history.len(), 2);
        assert_eq!(closed.visitor_id, "v1");
        assert_eq!(closed.chatbot_id, "bot1");
    }

    #[tokio::test]
    async fn test_closed_sessions_evicted_after_retention() {
        let hub = SessionHub::new(900);
        hub.open("c1", "v1", "bot1").await;
        hub.close("c1", CloseReason::Explicit).await.unwrap();

        // The tombstone lingers through sweeps inside the retention window.
        hub.sweep_idle(Utc::now()).await;
        assert_eq!(hub.state("c1").await, Some(SessionState::Closed));

        // Once retention passes, the entry is dropped entirely.
        let later = Utc::now() + Duration::seconds(CLOSED_RETENTION_SECS + 1);
        hub.sweep_idle(later).await;
        assert_eq!(hub.state("c1").await, None);
    }

    #[tokio::test]
    async fn test_idle_closed_sessions_evicted_after_retention() {
        let hub = SessionHub::new(60);
        hub.open("c1", "v1", "bot1").await;

        // First sweep closes it, a later one drops it.
        let close_time = Utc::now() + Duration::seconds(61);
        assert_eq!(hub.sweep_idle(close_time).await.len(), 1);
        assert_eq!(hub.state("c1").await, Some(SessionState::Closed));

        let evict_time = close_time + Duration::seconds(CLOSED_RETENTION_SECS + 1);
        hub.sweep_idle(evict_time).await;
        assert_eq!(hub.state("c1").await, None);
    }

    #[tokio::test]
    async fn test_open_existing_returns_current_state() {
        let hub = SessionHub::new(900);
        hub.open("c1", "v1", "bot1").await;
        hub.close("c1", CloseReason::Explicit).await;
        // Re-opening a closed conversation does not resurrect it.
        assert_eq!(hub.open("c1", "v1", "bot1").await, SessionState::Closed);
    }
}
