//! Error types for the live voice session

use thiserror::Error;

/// Result type alias for voice session operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur while running a live voice session
#[derive(Error, Debug)]
pub enum VoiceError {
    /// Open or handshake failure. Never retried; the session does not reach `Open`.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Capture or playback device could not be acquired.
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Transport went away without an explicit stop.
    #[error("Stream closed unexpectedly: {0}")]
    StreamClosedUnexpectedly(String),

    /// Host tool handler failed; contained at the broker boundary.
    #[error("Tool handler error: {0}")]
    ToolHandler(String),

    /// Malformed or out-of-contract inbound event; the event is dropped.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Session is not open (state: {0})")]
    SessionNotOpen(String),

    #[error("A session is already active")]
    AlreadyActive,

    #[error("Audio stream error: {0}")]
    AudioStream(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    /// Only connection and device failures abort a session start; everything
    /// else is contained and reported while the session keeps running.
    pub fn is_fatal_to_start(&self) -> bool {
        matches!(self, VoiceError::Connection(_) | VoiceError::DeviceUnavailable(_))
    }
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VoiceError::AudioStream(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::AudioStream(err.to_string())
    }
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}
