use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who authored a message in a conversation transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Visitor,
    Assistant,
    Agent,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Visitor => "visitor",
            Role::Assistant => "assistant",
            Role::Agent => "agent",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "visitor" => Ok(Role::Visitor),
            "assistant" => Ok(Role::Assistant),
            "agent" => Ok(Role::Agent),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Identity and location info carried on a presence join.
///
/// Geolocation fields are best-effort; absent means the lookup failed or
/// was skipped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VisitorInfo {
    pub visitor_id: String,
    pub chatbot_id: String,
    pub socket_id: String,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub long: Option<f64>,
}

/// One presence row as stored; at most one per room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisitorPresence {
    pub room: String,
    pub visitor_id: String,
    pub chatbot_id: String,
    pub socket_id: String,
    pub ip_address: Option<String>,
    pub city: Option<String>,
    pub region: Option<String>,
    pub country: Option<String>,
    pub lat: Option<f64>,
    pub long: Option<f64>,
    pub last_seen: DateTime<Utc>,
    pub is_online: bool,
}

/// Post-chat review, attachable to a conversation exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Review {
    pub rating: u8,
    #[serde(default)]
    pub review_data: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trip() {
        for role in [Role::Visitor, Role::Assistant, Role::Agent] {
            let parsed: Role = role.as_str().parse().unwrap();
            assert_eq!(parsed, role);
        }
        assert!("operator".parse::<Role>().is_err());
    }

    #[test]
    fn test_role_serde_snake_case() {
        let json = serde_json::to_value(Role::Assistant).unwrap();
        assert_eq!(json, "assistant");
        let back: Role = serde_json::from_value(json).unwrap();
        assert_eq!(back, Role::Assistant);
    }

    #[test]
    fn test_visitor_info_optional_fields_default() {
        let json = serde_json::json!({
            "visitor_id": "v1",
            "chatbot_id": "bot1",
            "socket_id": "s1"
        });
        let info: VisitorInfo = serde_json::from_value(json).unwrap();
        assert_eq!(info.visitor_id, "v1");
        assert!(info.ip_address.is_none());
        assert!(info.lat.is_none());
    }

    #[test]
    fn test_chat_message_serialization() {
        let msg = ChatMessage {
            role: Role::Visitor,
            text: "hello".into(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "visitor");
        assert_eq!(json["text"], "hello");
    }
}
