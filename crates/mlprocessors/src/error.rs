use std::time::Duration;

use mountaintools::ClientError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobError {
    /// Request does not fit the processor schema.
    #[error("validation error: {0}")]
    Validation(String),

    /// The processor body failed (fail-fast mode only).
    #[error("processor {processor} failed: {message}")]
    ProcessorRuntime { processor: String, message: String },

    #[error("unknown processor: {0}")]
    UnknownProcessor(String),

    /// No result appeared on a compute resource in time.
    #[error("timed out after {waited:?} waiting for job {fingerprint}")]
    Timeout {
        fingerprint: String,
        waited: Duration,
    },

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("failed to (de)serialize job data: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{context}: {source}")]
    Io {
        context: String,
        source: std::io::Error,
    },
}

impl JobError {
    /// Failures of the shared store itself, as opposed to the job.
    pub fn is_coordination(&self) -> bool {
        matches!(self, JobError::Client(e) if !e.is_not_found())
    }

    pub(crate) fn io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> Self {
        let context = context.into();
        move |source| JobError::Io { context, source }
    }
}
