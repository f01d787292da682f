//! Error types for the trainer binary.
//!
//! Session failures are not errors here: they end as a
//! [`SessionResult`](arena_types::SessionResult) and map to an exit code.
//! [`TrainerError`] covers what goes wrong around the session.

/// Top-level error for the trainer binary.
#[derive(Debug, thiserror::Error)]
pub enum TrainerError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: arena_core::config::ConfigError,
    },

    /// The session report could not be written.
    #[error("report error: {source}")]
    Report {
        /// The underlying serialization error.
        #[from]
        source: serde_json::Error,
    },

    /// The viewer could not be launched.
    #[error("viewer error: {message}")]
    Viewer {
        /// Description of the launch failure.
        message: String,
    },
}
