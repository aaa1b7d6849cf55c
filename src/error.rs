//! Error types for the assistant core.

/// Top-level error type for the voice assistant pipeline.
#[derive(Debug, thiserror::Error)]
pub enum AssistantError {
    /// Configuration validation failure.
    #[error("config error: {0}")]
    Config(String),

    /// A dependency could not be brought up during `initialize`.
    #[error("initialization failed: {0}")]
    InitializationFailed(String),

    /// Operation invoked against a component in the wrong lifecycle state.
    #[error("not ready: {0}")]
    NotReady(String),

    /// A bounded wait elapsed (LLM reply, server readiness).
    #[error("timed out: {0}")]
    Timeout(String),

    /// Non-zero exit from an STT/LLM/sink subprocess outside the expected
    /// cancellation codes.
    #[error("engine failed: {0}")]
    EngineFailed(String),

    /// Operation invoked on a disposed component.
    #[error("disposed: {0}")]
    Disposed(String),

    /// Audio device or playback error.
    #[error("audio error: {0}")]
    Audio(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error between pipeline tasks.
    #[error("channel error: {0}")]
    Channel(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, AssistantError>;
