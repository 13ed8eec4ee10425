use mlprocessors::JobError;
use mountaintools::ClientError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("batch {0} has no jobs")]
    EmptyBatch(String),

    #[error("job {index} uses unknown command '{command}'")]
    UnknownCommand { index: usize, command: String },

    /// The key/value store could not be read or written. Aborts a run.
    #[error("coordination failure: {0}")]
    Coordination(#[from] ClientError),

    #[error("batch {batch} still has {pending} unfinished jobs")]
    Incomplete { batch: String, pending: usize },

    #[error("batch {0} has not been assembled")]
    NotAssembled(String),

    #[error("batch {batch} has no job {index}")]
    NoSuchJob { batch: String, index: usize },

    #[error(transparent)]
    Job(#[from] JobError),

    #[error("malformed batch data: {0}")]
    Serialization(#[from] serde_json::Error),
}
