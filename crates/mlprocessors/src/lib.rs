//! Processors with declared schemas, run through a fingerprinted result cache.
//!
//! A [`Processor`] declares its inputs, outputs and parameters in a
//! [`ProcessorSpec`]. [`JobCache::execute`] validates a request against it,
//! computes a fingerprint from the processor identity, the parameters and
//! the content hashes of the inputs, and only runs the processor body when
//! no result is cached under that fingerprint.
//!
//! ```rust,no_run
//! # async fn demo(sorter: &dyn mlprocessors::Processor) -> Result<(), mlprocessors::JobError> {
//! use mlprocessors::{ExecuteOptions, JobCache, JobRequest};
//! use mountaintools::MountainClient;
//!
//! let cache = JobCache::new(MountainClient::open("/data/mountaintools")?);
//! let request = JobRequest::new()
//!     .param("detect_threshold", 3.0)
//!     .input("recording", "sha1://0123456789abcdef0123456789abcdef01234567/raw.mda");
//!
//! let result = cache.execute(sorter, &request, ExecuteOptions::new()).await?;
//! println!("retcode {} (cached: {})", result.retcode, result.from_cache);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod command;
pub mod error;
pub mod fingerprint;
pub mod processor;
pub mod resource;
pub mod result;
pub mod spec;

pub use cache::{JobCache, PreparedJob};
pub use command::{command_processors, CommandProcessor};
pub use error::JobError;
pub use fingerprint::compute_fingerprint;
pub use processor::{ExitCode, JobContext, Processor, ProcessorRegistry};
pub use resource::{queue_key, ComputeResource, QueuedJob, ResourceWorker};
pub use result::{ExecuteOptions, JobRequest, JobResult, RuntimeInfo};
pub use spec::{ParamKind, ParamSpec, ProcessorSpec, SlotSpec};
