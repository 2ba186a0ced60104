//! Error types for the voice call engine

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Call error: {0}")]
    Call(#[from] CallError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio subsystem errors
#[derive(Error, Debug, Clone)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Failed to start stream: {0}")]
    PlayError(String),

    #[error("Echo canceller initialization failed: {0}")]
    EchoInit(String),

    #[error("Echo cancellation failed: {0}")]
    EchoFailed(String),

    #[error("Frame length mismatch: expected {expected}, got {actual}")]
    FrameSize { expected: usize, actual: usize },

    #[error("cpal error: {0}")]
    CpalError(String),
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed on port {port}: {source}")]
    BindFailed {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid peer address: {0}")]
    InvalidPeer(String),

    #[error("Invalid packet size: expected {expected} bytes, got {actual}")]
    InvalidPacket { expected: usize, actual: usize },
}

/// Call lifecycle errors
#[derive(Error, Debug)]
pub enum CallError {
    #[error("A call is already active")]
    AlreadyActive,

    #[error("No active call")]
    NotActive,
}

impl From<cpal::BuildStreamError> for AudioError {
    fn from(e: cpal::BuildStreamError) -> Self {
        AudioError::StreamError(e.to_string())
    }
}

impl From<cpal::PlayStreamError> for AudioError {
    fn from(e: cpal::PlayStreamError) -> Self {
        AudioError::PlayError(e.to_string())
    }
}

impl From<cpal::PauseStreamError> for AudioError {
    fn from(e: cpal::PauseStreamError) -> Self {
        AudioError::CpalError(e.to_string())
    }
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
