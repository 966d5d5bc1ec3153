//! Error types for the history subsystem.
//!
//! The `Display` text of [`GeneratorError`] is shown to the user verbatim, so
//! each variant keeps its own message.

use std::path::PathBuf;

use uuid::Uuid;

/// Failures talking to the Ollama server.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GeneratorError {
    #[error("Ollama server unavailable. Make sure Ollama is running.")]
    ServiceUnavailable,

    #[error("Model '{0}' not found. Make sure the model is installed in Ollama.")]
    ModelNotFound(String),

    #[error("Ollama server error. Check if the model is loaded and working properly.")]
    ServerError,

    #[error("Ollama server error (HTTP {0})")]
    Http(u16),

    #[error("Request timed out. The model might be taking too long to respond.")]
    Timeout,

    #[error("Cannot connect to Ollama. Make sure Ollama is running on {0}")]
    ConnectionRefused(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Failed to decode Ollama response: {0}")]
    Decode(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error("Failed to open audio file {path}: {reason}")]
    FileOpen { path: PathBuf, reason: String },

    #[error("Audio output unavailable: {0}")]
    Output(String),
}

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("History I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("History serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transcript {0} already exists")]
    DuplicateId(Uuid),
}

/// Errors surfaced by [`crate::service::HistoryHandle`].
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("History service is not running")]
    Closed,

    #[error("Transcript {0} not found")]
    NotFound(Uuid),

    #[error("Clipboard error: {0}")]
    Clipboard(String),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Playback(#[from] PlaybackError),
}
