//! Error taxonomy shared by every component
//!
//! Only [`PipelineError::Configuration`] is fatal, and only at startup.
//! Everything else is logged, counted, and survived by the component that
//! hit it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Camera read failure, bus hiccup or other retryable I/O
    #[error("transient I/O failure: {0}")]
    TransientIo(String),

    /// The inference backend failed or timed out for one frame
    #[error("inference failed: {0}")]
    Inference(String),

    /// Segment write/read failure
    #[error("storage failure: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    /// A bus payload could not be encoded or decoded
    #[error("codec error: {0}")]
    Codec(String),

    /// Rejected by the control API before anything was published
    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

impl PipelineError {
    /// True for errors a component should retry or skip past.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            PipelineError::Configuration(_) | PipelineError::InvalidCommand(_)
        )
    }
}

impl From<rmp_serde::encode::Error> for PipelineError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        PipelineError::Codec(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for PipelineError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        PipelineError::Codec(err.to_string())
    }
}
