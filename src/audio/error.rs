use thiserror::Error;

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("realtime session is not active")]
    SessionInactive,

    #[error("microphone permission not granted")]
    PermissionDenied,

    #[error("audio device unavailable: {0}")]
    Device(String),

    #[error("audio stream error: {0}")]
    Stream(String),
}

pub type Result<T> = std::result::Result<T, AudioError>;
