use thiserror::Error;

#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("API key is missing or a placeholder")]
    InvalidCredential,

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("session is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, RealtimeError>;
