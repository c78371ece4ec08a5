use thiserror::Error;

use crate::llm::LlmError;

/// Errors surfaced to callers of the pipeline API. Terminal pipeline states
/// are not errors; they are `QueryOutcome` values in the audit trail.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The caller exceeded the sliding-window limit at the text-generation
    /// boundary. Back off and resubmit; nothing was queued.
    #[error("rate limited; back off and resubmit")]
    RateLimited,

    #[error("unknown query id: {0}")]
    UnknownQuery(uuid::Uuid),

    #[error("no pending disambiguation for query {0}")]
    NotPending(uuid::Uuid),

    #[error("interpretation choice {choice} out of range (0..{len})")]
    SelectionOutOfRange { choice: usize, len: usize },

    #[error("text generation failed: {0}")]
    Llm(#[from] LlmError),

    #[error("data store error: {0}")]
    Store(String),
}
