use thiserror::Error;

#[derive(Error, Debug)]
pub enum HelpDockError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Stream ended without a terminal record")]
    UnexpectedEndOfStream,

    #[error("Assistant API error: {0}")]
    AssistantApi(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Conversation {0} is closed")]
    SessionClosed(String),

    #[error("Conversation {0} already has a review")]
    ReviewAlreadySubmitted(String),

    #[error("Not found: {0}")]
    NotFound(String),
}
