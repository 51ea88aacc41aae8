use futures_util::Stream;
use serde::Serialize;

use helpdock_core::error::HelpDockError;

use crate::config::Config;
use crate::stream::{decode_byte_stream, StreamEvent};

#[derive(Debug, Clone, Serialize)]
pub struct StreamChatRequest {
    pub visitor_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visitor_email: Option<String>,
    pub chatbot_id: String,
    pub conversation_id: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub plan_flags: Vec<String>,
}

/// Client for the assistant backend's streaming chat endpoint.
pub struct AssistantClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl AssistantClient {
    pub fn new(config: &Config) -> Self {
        AssistantClient {
            http: reqwest::Client::new(),
            base_url: config.assistant_base_url.clone(),
            api_key: config.assistant_api_key.clone(),
        }
    }

    /// Open a streaming chat request and return the lazily decoded event
    /// stream. Dropping the stream aborts the transfer.
    pub async fn stream_chat(
        &self,
        request: &StreamChatRequest,
    ) -> Result<impl Stream<Item = StreamEvent>, HelpDockError> {
        let response = self
            .http
            .post(format!("{}/v1/chat/stream", self.base_url))
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HelpDockError::AssistantApi(format!("HTTP {status}: {body}")));
        }

        Ok(decode_byte_stream(response.bytes_stream()))
    }
}
