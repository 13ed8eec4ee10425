//! Compute resources: where a job's processor body actually runs.
//!
//! A queue resource is just a KV key. Submitters add the job as a subkey
//! (named by fingerprint) and poll the result cache; workers sharing the
//! same store (usually through a remote) claim subkeys, run them, and write
//! the result where the submitter is looking.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kvstore::Key;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::JobCache;
use crate::error::JobError;
use crate::processor::{Processor, ProcessorRegistry};
use crate::result::{ExecuteOptions, JobRequest, JobResult};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ComputeResource {
    /// Run in this process.
    #[default]
    Local,
    /// Hand off to workers serving the named queue.
    Queue(String),
}

/// A submission waiting on a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub processor: String,
    pub request: JobRequest,
    #[serde(default)]
    pub force_run: bool,
    pub submitted_at: DateTime<Utc>,
}

pub fn queue_key(name: &str) -> Key {
    Key::structured([("mlprocessors", "compute_resource"), ("name", name)])
}

fn claim_key(name: &str, fingerprint: &str) -> Key {
    Key::structured([
        ("mlprocessors", "compute_claim"),
        ("name", name),
        ("fingerprint", fingerprint),
    ])
}

impl JobCache {
    /// [`execute`](Self::execute) on a compute resource.
    ///
    /// Validation happens here either way, so fail-fast callers see
    /// [`JobError::Validation`] without anything being queued.
    pub async fn execute_on(
        &self,
        resource: &ComputeResource,
        processor: &dyn Processor,
        request: &JobRequest,
        options: ExecuteOptions,
    ) -> Result<JobResult, JobError> {
        let queue = match resource {
            ComputeResource::Local => return self.execute(processor, request, options).await,
            ComputeResource::Queue(name) => name,
        };

        let spec = processor.spec();
        let prepared = self.prepare(spec, request).await?;
        let fingerprint = prepared.fingerprint.to_string();
        if let (Some(msg), false) = (&prepared.invalid, options.skip_failing) {
            return Err(JobError::Validation(msg.clone()));
        }
        if !options.force_run {
            if let Some(hit) = self.lookup(&fingerprint).await? {
                return Ok(hit);
            }
        }

        let submitted_at = Utc::now();
        let job = QueuedJob {
            processor: spec.name.clone(),
            request: request.clone(),
            force_run: options.force_run,
            submitted_at,
        };
        self.client()
            .set_value(
                &queue_key(queue),
                Some(&fingerprint),
                Some(serde_json::to_value(&job)?),
                None,
            )
            .await?;
        info!(job.fingerprint = %fingerprint, resource = %queue, "job queued");

        let started = Instant::now();
        loop {
            if let Some(result) = self.latest_result(&fingerprint).await? {
                // A forced run must not pick up the result it is replacing.
                if !options.force_run || result.runtime_info.end_time >= submitted_at {
                    return Ok(result);
                }
            }
            if let Some(timeout) = self.queue_timeout {
                if started.elapsed() >= timeout {
                    return Err(JobError::Timeout {
                        fingerprint,
                        waited: timeout,
                    });
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn latest_result(&self, fingerprint: &str) -> Result<Option<JobResult>, JobError> {
        let value = self
            .client()
            .get_latest_value(&JobCache::result_key(fingerprint), None, None)
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
}

/// Serves one queue, running jobs with processors from a registry.
pub struct ResourceWorker {
    name: String,
    cache: JobCache,
    registry: Arc<ProcessorRegistry>,
    worker_id: String,
}

impl ResourceWorker {
    pub fn new(name: impl Into<String>, cache: JobCache, registry: Arc<ProcessorRegistry>) -> Self {
        Self {
            name: name.into(),
            cache,
            registry,
            worker_id: uuid::Uuid::new_v4().simple().to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Claim and run every job currently queued. Returns how many ran here.
    pub async fn serve_once(&self) -> Result<usize, JobError> {
        let queue = queue_key(&self.name);
        let client = self.cache.client();
        let mut handled = 0;

        for fingerprint in client.get_latest_subkeys(&queue).await? {
            let Some(raw) = client
                .get_latest_value(&queue, Some(&fingerprint), None)
                .await?
            else {
                continue;
            };
            let claim = claim_key(&self.name, &fingerprint);
            let claimed = client
                .set_if_absent(&claim, json!({"worker": self.worker_id, "claimed_at": Utc::now()}))
                .await?;
            if !claimed {
                debug!(job.fingerprint = %fingerprint, "job claimed elsewhere");
                continue;
            }

            if let Err(e) = self.handle(&fingerprint, raw).await {
                // Nothing was recorded, so leave the job queued for the next
                // pass and let the claim go.
                if let Err(release) = client.set_value(&claim, None, None, None).await {
                    warn!(job.fingerprint = %fingerprint, error = %release, "failed to release claim");
                }
                return Err(e);
            }

            client.set_value(&queue, Some(&fingerprint), None, None).await?;
            client.set_value(&claim, None, None, None).await?;
            handled += 1;
        }
        Ok(handled)
    }

    /// Run one claimed job and make sure a result ends up in the cache.
    ///
    /// Only failures to reach the store come back as errors; anything the
    /// job itself trips over is cached as a failed result.
    async fn handle(&self, fingerprint: &str, raw: serde_json::Value) -> Result<(), JobError> {
        let job = match serde_json::from_value::<QueuedJob>(raw) {
            Ok(job) => job,
            Err(e) => {
                warn!(job.fingerprint = %fingerprint, error = %e, "unreadable queued job");
                self.cache
                    .store_failure(fingerprint, "", "", format!("unreadable queued job: {}", e))
                    .await?;
                return Ok(());
            }
        };

        let processor = job.processor.clone();
        match self.run_job(fingerprint, job).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_coordination() => Err(e),
            Err(e) => {
                warn!(
                    job.fingerprint = %fingerprint,
                    job.processor = %processor,
                    error = %e,
                    "queued job failed before producing a result"
                );
                self.cache
                    .store_failure(fingerprint, &processor, "", e.to_string())
                    .await?;
                Ok(())
            }
        }
    }

    async fn run_job(&self, fingerprint: &str, job: QueuedJob) -> Result<(), JobError> {
        let Some(processor) = self.registry.get(&job.processor) else {
            warn!(job.fingerprint = %fingerprint, job.processor = %job.processor, "unknown processor");
            self.cache
                .store_failure(
                    fingerprint,
                    &job.processor,
                    "",
                    JobError::UnknownProcessor(job.processor.clone()).to_string(),
                )
                .await?;
            return Ok(());
        };

        // Versions on both sides must agree or the result would be cached
        // under a fingerprint the submitter never asked for.
        let spec = processor.spec();
        let prepared = self.cache.prepare(spec, &job.request).await?;
        if prepared.fingerprint.as_str() != fingerprint {
            warn!(
                job.fingerprint = %fingerprint,
                job.processor = %spec.name,
                local_fingerprint = %prepared.fingerprint,
                "fingerprint mismatch"
            );
            self.cache
                .store_failure(
                    fingerprint,
                    &spec.name,
                    &spec.version,
                    format!(
                        "processor {} version {} on resource {} does not match the submitted job",
                        spec.name, spec.version, self.name
                    ),
                )
                .await?;
            return Ok(());
        }

        let mut options = ExecuteOptions::new();
        if job.force_run {
            options = options.force_run();
        }
        let result = self.cache.execute(processor.as_ref(), &job.request, options).await?;
        info!(
            job.fingerprint = %fingerprint,
            job.processor = %spec.name,
            job.retcode = result.retcode,
            resource = %self.name,
            "queued job finished"
        );
        Ok(())
    }

    /// Serve until `shutdown` turns true.
    pub async fn serve(
        &self,
        poll_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), JobError> {
        info!(resource = %self.name, worker = %self.worker_id, "resource worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let handled = self.serve_once().await?;
            if handled == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        info!(resource = %self.name, "resource worker stopped");
        Ok(())
    }
}

impl std::fmt::Debug for ResourceWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceWorker")
            .field("name", &self.name)
            .field("worker_id", &self.worker_id)
            .finish()
    }
}
