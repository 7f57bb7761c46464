//! Error types for the thumbnail worker.
//!
//! Each variant maps to one disposition at the consumer loop: `Format`,
//! `Processing` and `Storage` dead-letter the message with a truncated
//! reason, `Store` is logged and the message is still acknowledged, and
//! `Transport` is handled at the loop level with a backoff pause.

use thiserror::Error;

/// Errors that can occur while processing a job message.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Message body could not be decoded into a job request
    #[error("Malformed message body: {0}")]
    Format(String),

    /// Image decode/derive/encode failed
    #[error("Image processing failed: {0}")]
    Processing(String),

    /// Object store download or upload failed
    #[error("Object storage error: {0}")]
    Storage(String),

    /// Status record update failed
    #[error("Status store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Queue receive/ack/dead-letter failed
    #[error("Queue transport error: {0}")]
    Transport(String),
}

/// Result type for worker operations
pub type Result<T> = std::result::Result<T, WorkerError>;

/// Maximum length of a dead-letter reason string.
pub const MAX_REASON_LEN: usize = 250;

/// Truncate an error reason for attachment to a dead-letter message.
pub fn truncate_reason(reason: &str) -> String {
    reason.chars().take(MAX_REASON_LEN).collect()
}
