use thiserror::Error;

/// Errors surfaced by the consultation flow.
///
/// Only `SessionNotFound` and `InvalidSection` abort a user-facing turn;
/// classification, summarization and streaming irregularities are recovered
/// locally so the conversation never stalls.
#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Invalid section: {0}")]
    InvalidSection(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Retrieval error: {0}")]
    Retrieval(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FlowError>;
