//! Batches of cached jobs, run by any number of cooperating workers.
//!
//! A batch is a named list of [`BatchJob`]s stored in the key/value store.
//! Workers claim jobs one at a time with `set_if_absent`, run them through
//! a [`mlprocessors::JobCache`], and record the outcome. Once every job has
//! finished, [`BatchCoordinator::assemble_batch`] gathers the results.
//!
//! ```rust,no_run
//! # async fn demo() -> Result<(), batcho::BatchError> {
//! use batcho::{BatchCoordinator, BatchJob, CommandRegistry, RunOptions};
//! use mlprocessors::JobCache;
//! use mountaintools::MountainClient;
//!
//! let client = MountainClient::open("/data/mountaintools")?;
//! let coordinator = BatchCoordinator::new(JobCache::new(client), CommandRegistry::new());
//!
//! coordinator
//!     .set_batch("synth", vec![BatchJob::new("sort", "r1").param("threshold", 3)])
//!     .await?;
//! coordinator.run_batch("synth", &RunOptions::default()).await?;
//! let results = coordinator.assemble_batch("synth").await?;
//! # Ok(())
//! # }
//! ```

pub mod coordinator;
pub mod error;
pub mod job;
pub mod registry;

pub use coordinator::{
    BatchCoordinator, JobOutcome, JobProgress, PrepareReport, RunOptions, RunSummary,
};
pub use error::BatchError;
pub use job::{
    status_label, BatchJob, BatchJobResult, BatchResults, BatchState, BatchSummary, JobState,
    JobStatusRecord,
};
pub use registry::CommandRegistry;
