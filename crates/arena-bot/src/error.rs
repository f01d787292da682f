//! Error types for the reference agent.

/// Errors that can occur while serving a trainer connection.
#[derive(Debug, thiserror::Error)]
pub enum BotError {
    /// The connection failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failure.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// The trainer broke the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Configuration is invalid.
    #[error("config error: {0}")]
    Config(String),
}
