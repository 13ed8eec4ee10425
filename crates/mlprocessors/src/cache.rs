//! JobCache: fingerprinted, cached processor execution.
//!
//! ```text
//! execute(processor, request)
//!   ├─ validate + fingerprint
//!   ├─ cached result? ──────────────► return (from_cache = true)
//!   ├─ invalid request ─────────────► error result (retcode 1), cached
//!   └─ run body, capture console ───► result, outputs saved to CAS, cached
//! ```
//!
//! In fail-fast mode validation and processor failures come back as
//! [`JobError`]s instead and nothing is cached.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::BufReader;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use cas::Sha1Hash;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use kvstore::Key;
use mountaintools::MountainClient;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::JobError;
use crate::fingerprint::compute_fingerprint;
use crate::processor::{ExitCode, JobContext, Processor};
use crate::result::{ExecuteOptions, JobRequest, JobResult, RuntimeInfo};
use crate::spec::ProcessorSpec;

/// A request checked against its processor's schema.
#[derive(Debug, Clone)]
pub struct PreparedJob {
    pub fingerprint: Sha1Hash,
    /// Coerced parameters, or the raw ones (defaults applied) when invalid.
    pub parameters: BTreeMap<String, Value>,
    /// Why the request doesn't fit the schema.
    pub invalid: Option<String>,
}

#[derive(Debug, Clone)]
pub struct JobCache {
    client: MountainClient,
    pub(crate) poll_interval: Duration,
    pub(crate) queue_timeout: Option<Duration>,
}

impl JobCache {
    pub fn new(client: MountainClient) -> Self {
        Self {
            client,
            poll_interval: Duration::from_millis(2000),
            queue_timeout: None,
        }
    }

    /// How often queued submissions poll for their result.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Give up on queued submissions after `timeout`. Default: wait forever.
    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = Some(timeout);
        self
    }

    pub fn client(&self) -> &MountainClient {
        &self.client
    }

    /// Key holding the cached result for a fingerprint.
    pub fn result_key(fingerprint: &str) -> Key {
        Key::structured([("mlprocessors", "job_result"), ("fingerprint", fingerprint)])
    }

    /// Validate a request and compute its fingerprint.
    ///
    /// Schema violations are reported in [`PreparedJob::invalid`]; only
    /// storage failures while hashing inputs are errors.
    pub async fn prepare(
        &self,
        spec: &ProcessorSpec,
        request: &JobRequest,
    ) -> Result<PreparedJob, JobError> {
        let with_defaults = spec.with_defaults(&request.parameters);
        let checked = spec
            .validate_parameters(&with_defaults)
            .and_then(|p| spec.validate_inputs(&request.inputs).map(|_| p));
        let input_hashes = self.input_hashes(&request.inputs).await?;

        let (parameters, invalid) = match checked {
            Ok(p) => (p, None),
            Err(msg) => (with_defaults, Some(msg)),
        };
        let fingerprint = compute_fingerprint(spec, &parameters, &input_hashes);

        Ok(PreparedJob {
            fingerprint,
            parameters,
            invalid,
        })
    }

    async fn input_hashes(
        &self,
        inputs: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, Sha1Hash>, JobError> {
        let mut hashes = BTreeMap::new();
        for (slot, reference) in inputs {
            let hash = match self.client.resolve_address(reference).await? {
                Some(address) => address.hash,
                None => {
                    let file = File::open(reference)
                        .map_err(JobError::io(format!("failed to open input {}", reference)))?;
                    Sha1Hash::from_reader(BufReader::new(file))
                        .map_err(JobError::io(format!("failed to hash input {}", reference)))?
                }
            };
            hashes.insert(slot.clone(), hash);
        }
        Ok(hashes)
    }

    /// Cached result for a fingerprint, if any.
    pub async fn lookup(&self, fingerprint: &str) -> Result<Option<JobResult>, JobError> {
        let value = self
            .client
            .get_value(&Self::result_key(fingerprint), None, None)
            .await?;
        match value {
            Some(v) => {
                let mut result: JobResult = serde_json::from_value(v)?;
                result.from_cache = true;
                Ok(Some(result))
            }
            None => Ok(None),
        }
    }

    /// Drop the cached result for a fingerprint.
    pub async fn invalidate(&self, fingerprint: &str) -> Result<(), JobError> {
        self.client
            .set_value(&Self::result_key(fingerprint), None, None, None)
            .await?;
        info!(job.fingerprint = %fingerprint, "job result invalidated");
        Ok(())
    }

    pub(crate) async fn store(&self, result: &JobResult) -> Result<(), JobError> {
        self.client
            .set_value(
                &Self::result_key(&result.fingerprint),
                None,
                Some(serde_json::to_value(result)?),
                None,
            )
            .await?;
        Ok(())
    }

    /// Cache a failure that never reached a processor body.
    pub(crate) async fn store_failure(
        &self,
        fingerprint: &str,
        processor_name: &str,
        processor_version: &str,
        message: String,
    ) -> Result<JobResult, JobError> {
        let now = Utc::now();
        let result = failure_result(
            fingerprint,
            processor_name,
            processor_version,
            1,
            message,
            now,
            now,
        );
        self.store(&result).await?;
        Ok(result)
    }

    /// Validate, look up, and if needed run a processor.
    pub async fn execute(
        &self,
        processor: &dyn Processor,
        request: &JobRequest,
        options: ExecuteOptions,
    ) -> Result<JobResult, JobError> {
        let spec = processor.spec();
        let prepared = self.prepare(spec, request).await?;
        let fingerprint = prepared.fingerprint.to_string();

        if let (Some(msg), false) = (&prepared.invalid, options.skip_failing) {
            return Err(JobError::Validation(msg.clone()));
        }

        if !options.force_run {
            if let Some(hit) = self.lookup(&fingerprint).await? {
                info!(
                    job.fingerprint = %fingerprint,
                    job.processor = %spec.name,
                    job.retcode = hit.retcode,
                    "job cache hit"
                );
                return Ok(hit);
            }
        }

        let result = match &prepared.invalid {
            Some(msg) => {
                warn!(
                    job.fingerprint = %fingerprint,
                    job.processor = %spec.name,
                    job.error = %msg,
                    "job failed validation"
                );
                let now = Utc::now();
                failure_result(&fingerprint, &spec.name, &spec.version, 1, msg.clone(), now, now)
            }
            None => self.run(processor, &prepared, request, options).await?,
        };

        self.store(&result).await?;
        Ok(result)
    }

    async fn run(
        &self,
        processor: &dyn Processor,
        prepared: &PreparedJob,
        request: &JobRequest,
        options: ExecuteOptions,
    ) -> Result<JobResult, JobError> {
        let spec = processor.spec();
        let fingerprint = prepared.fingerprint.to_string();

        let mut inputs = BTreeMap::new();
        for (slot, reference) in &request.inputs {
            inputs.insert(slot.clone(), self.client.realize_file(reference).await?);
        }

        let work_dir = self
            .client
            .tmp_dir()
            .join("jobs")
            .join(format!("{}-{}", fingerprint, Uuid::new_v4().simple()));
        fs::create_dir_all(&work_dir).map_err(JobError::io("failed to create job directory"))?;
        let outputs: BTreeMap<String, _> = spec
            .outputs
            .iter()
            .map(|s| (s.name.clone(), work_dir.join(&s.name)))
            .collect();

        let mut ctx = JobContext::new(prepared.parameters.clone(), inputs, outputs.clone());

        info!(job.fingerprint = %fingerprint, job.processor = %spec.name, "job started");
        let start = Utc::now();
        // A panicking body is a failed job like any other.
        let outcome = match AssertUnwindSafe(processor.run(&mut ctx)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(payload) => Err(anyhow::anyhow!(
                "processor panicked: {}",
                panic_message(payload.as_ref())
            )),
        };
        let end = Utc::now();
        let mut console = ctx.into_console();

        let outcome = match outcome {
            Ok(value) => {
                let mut addresses = BTreeMap::new();
                let mut missing = None;
                for slot in &spec.outputs {
                    let Some(path) = outputs.get(&slot.name) else {
                        continue;
                    };
                    if path.exists() {
                        let address = self.client.save_file(path, None).await?;
                        addresses.insert(slot.name.clone(), address.to_string());
                    } else if !slot.optional {
                        missing = Some(slot.name.clone());
                        break;
                    }
                }
                match missing {
                    None => Ok((value, addresses)),
                    Some(slot) => Err((1, format!("output '{}' was not produced", slot))),
                }
            }
            Err(e) => {
                let retcode = e
                    .downcast_ref::<ExitCode>()
                    .map(|c| c.0)
                    .filter(|c| *c != 0)
                    .unwrap_or(1);
                Err((retcode, format!("{:#}", e)))
            }
        };

        if let Err(e) = fs::remove_dir_all(&work_dir) {
            debug!(path = %work_dir.display(), error = %e, "failed to remove job directory");
        }

        match outcome {
            Ok((value, addresses)) => {
                let runtime_info = RuntimeInfo::between(start, end);
                info!(
                    job.fingerprint = %fingerprint,
                    job.processor = %spec.name,
                    job.elapsed_secs = runtime_info.elapsed_secs,
                    "job completed"
                );
                Ok(JobResult {
                    fingerprint,
                    processor_name: spec.name.clone(),
                    processor_version: spec.version.clone(),
                    retcode: 0,
                    console_output: console,
                    runtime_info,
                    outputs: addresses,
                    result: value,
                    from_cache: false,
                })
            }
            Err((retcode, message)) => {
                warn!(
                    job.fingerprint = %fingerprint,
                    job.processor = %spec.name,
                    job.retcode = retcode,
                    job.error = %message,
                    "job failed"
                );
                if !options.skip_failing {
                    return Err(JobError::ProcessorRuntime {
                        processor: spec.name.clone(),
                        message,
                    });
                }
                if !console.is_empty() && !console.ends_with('\n') {
                    console.push('\n');
                }
                let _ = writeln!(console, "{}", message);
                Ok(failure_result(
                    &fingerprint,
                    &spec.name,
                    &spec.version,
                    retcode,
                    console,
                    start,
                    end,
                ))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

fn failure_result(
    fingerprint: &str,
    processor_name: &str,
    processor_version: &str,
    retcode: i32,
    console_output: String,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> JobResult {
    JobResult {
        fingerprint: fingerprint.to_string(),
        processor_name: processor_name.to_string(),
        processor_version: processor_version.to_string(),
        retcode,
        console_output,
        runtime_info: RuntimeInfo::between(start, end),
        outputs: BTreeMap::new(),
        result: Value::Null,
        from_cache: false,
    }
}
