//! The batch coordinator.
//!
//! Workers on any number of machines share one key/value store. Each job
//! has a status key; a worker takes a job by writing its claim there with
//! `set_if_absent`, and records the outcome with a `compare_and_set` that
//! expects its own claim, so a worker whose claim was reclaimed as stale
//! cannot overwrite the newer owner's status.
//!
//! ```text
//! batch:  empty ─► populated ─► preparing ─► prepared ─► running ─► assembled
//! job:    not-started ─► in-process-<token> ─► complete | error-<token>
//!                              │ no heartbeat for claim_stale_secs
//!                              └─► in-process-<new token>
//! ```

use std::time::Duration;

use chrono::Utc;
use mlprocessors::{ExecuteOptions, JobCache, JobError};
use mountaintools::MountainClient;
use mtconfig::BatchConfig;
use rand::distributions::Alphanumeric;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::BatchError;
use crate::job::{
    index_key, jobs_key, results_key, state_key, status_key, status_label, stop_key, BatchJob,
    BatchJobResult, BatchResults, BatchState, BatchSummary, JobState, JobStatusRecord,
};
use crate::registry::CommandRegistry;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Visit pending jobs in random order, so concurrent workers collide less.
    pub randomize_order: bool,
    /// Recorded in claims, for status displays.
    pub worker_label: String,
    /// Stop after running this many jobs.
    pub max_jobs: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobOutcome {
    Complete,
    Error,
    /// Our claim was replaced before we could record the outcome.
    ClaimLost,
}

/// Reported after each job a worker runs.
#[derive(Debug, Clone, Serialize)]
pub struct JobProgress {
    pub index: usize,
    pub label: String,
    pub outcome: JobOutcome,
    pub retcode: Option<i32>,
    pub from_cache: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub completed: usize,
    pub errored: usize,
    pub claims_lost: usize,
    /// The run ended because the batch was stopped.
    pub stopped: bool,
}

impl RunSummary {
    pub fn ran(&self) -> usize {
        self.completed + self.errored + self.claims_lost
    }

    fn record(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Complete => self.completed += 1,
            JobOutcome::Error => self.errored += 1,
            JobOutcome::ClaimLost => self.claims_lost += 1,
        }
    }
}

/// What running one job produced, before it is written to the status key.
struct Execution {
    status: JobState,
    fingerprint: Option<String>,
    retcode: Option<i32>,
    error: Option<String>,
    from_cache: bool,
}

impl Execution {
    fn failed(error: String) -> Self {
        Self {
            status: JobState::Error,
            fingerprint: None,
            retcode: None,
            error: Some(error),
            from_cache: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PrepareReport {
    pub jobs: usize,
    /// Jobs whose parameters don't fit their command; they will run to an error.
    pub invalid: Vec<(usize, String)>,
    pub inputs_realized: usize,
}

#[derive(Debug, Clone)]
pub struct BatchCoordinator {
    cache: JobCache,
    registry: CommandRegistry,
    claim_stale: chrono::Duration,
    poll_interval: Duration,
}

impl BatchCoordinator {
    pub fn new(cache: JobCache, registry: CommandRegistry) -> Self {
        let defaults = BatchConfig::default();
        Self {
            cache,
            registry,
            claim_stale: chrono::Duration::seconds(defaults.claim_stale_secs as i64),
            poll_interval: Duration::from_millis(defaults.poll_interval_ms),
        }
    }

    pub fn with_batch_config(mut self, config: &BatchConfig) -> Self {
        self.claim_stale = chrono::Duration::seconds(config.claim_stale_secs as i64);
        self.poll_interval = Duration::from_millis(config.poll_interval_ms);
        self
    }

    /// Age after which another worker may take over an in-process job.
    pub fn with_claim_stale(mut self, after: Duration) -> Self {
        self.claim_stale =
            chrono::Duration::from_std(after).unwrap_or_else(|_| chrono::Duration::weeks(5200));
        self
    }

    pub fn client(&self) -> &MountainClient {
        self.cache.client()
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    // ------------------------------------------------------------------
    // Batch definition
    // ------------------------------------------------------------------

    /// Replace the batch's job list. Statuses and results of the previous
    /// list are dropped.
    pub async fn set_batch(&self, name: &str, jobs: Vec<BatchJob>) -> Result<(), BatchError> {
        self.forget_progress(name).await?;
        let client = self.client();
        client
            .set_value(&jobs_key(name), None, Some(serde_json::to_value(&jobs)?), None)
            .await?;
        client
            .set_value(&index_key(), Some(name), Some(json!(true)), None)
            .await?;
        self.set_state(name, BatchState::Populated).await?;
        info!(batch.name = %name, batch.jobs = jobs.len(), "batch set");
        Ok(())
    }

    pub async fn get_batch_jobs(&self, name: &str) -> Result<Vec<BatchJob>, BatchError> {
        match self.client().get_latest_value(&jobs_key(name), None, None).await? {
            Some(v) => Ok(serde_json::from_value(v)?),
            None => Ok(Vec::new()),
        }
    }

    pub async fn get_batch_state(&self, name: &str) -> Result<BatchState, BatchError> {
        match self.client().get_latest_value(&state_key(name), None, None).await? {
            Some(v) => Ok(serde_json::from_value(v)?),
            None => Ok(BatchState::Empty),
        }
    }

    async fn set_state(&self, name: &str, state: BatchState) -> Result<(), BatchError> {
        self.client()
            .set_value(&state_key(name), None, Some(serde_json::to_value(state)?), None)
            .await?;
        debug!(batch.name = %name, batch.state = %state, "batch state");
        Ok(())
    }

    /// Check every job against its command and fetch its inputs ahead of
    /// the run.
    pub async fn prepare_batch(&self, name: &str) -> Result<PrepareReport, BatchError> {
        let jobs = self.get_batch_jobs(name).await?;
        if jobs.is_empty() {
            return Err(BatchError::EmptyBatch(name.to_string()));
        }
        let mut processors = Vec::with_capacity(jobs.len());
        for (index, job) in jobs.iter().enumerate() {
            let processor = self
                .registry
                .get(&job.command)
                .ok_or_else(|| BatchError::UnknownCommand {
                    index,
                    command: job.command.clone(),
                })?;
            processors.push(processor);
        }

        self.set_state(name, BatchState::Preparing).await?;
        let mut report = PrepareReport {
            jobs: jobs.len(),
            ..PrepareReport::default()
        };
        for (index, (job, processor)) in jobs.iter().zip(&processors).enumerate() {
            let request = job.to_request(processor.spec());
            let prepared = self.cache.prepare(processor.spec(), &request).await?;
            if let Some(msg) = prepared.invalid {
                warn!(batch.name = %name, job.index = index, job.label = %job.label, error = %msg, "invalid job");
                report.invalid.push((index, msg));
                continue;
            }
            for reference in request.inputs.values() {
                self.client()
                    .realize_file(reference)
                    .await
                    .map_err(JobError::from)?;
                report.inputs_realized += 1;
            }
        }
        self.set_state(name, BatchState::Prepared).await?;
        info!(
            batch.name = %name,
            batch.jobs = report.jobs,
            batch.invalid = report.invalid.len(),
            "batch prepared"
        );
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Running
    // ------------------------------------------------------------------

    pub async fn run_batch(&self, name: &str, options: &RunOptions) -> Result<RunSummary, BatchError> {
        self.run_batch_with(name, options, |_| {}).await
    }

    /// Claim and run pending jobs until none are left, the batch is
    /// stopped, or `max_jobs` have run. `on_job` sees each finished job.
    ///
    /// Job failures are recorded in the job's status; only store failures
    /// end the run early.
    pub async fn run_batch_with(
        &self,
        name: &str,
        options: &RunOptions,
        mut on_job: impl FnMut(&JobProgress) + Send,
    ) -> Result<RunSummary, BatchError> {
        let jobs = self.get_batch_jobs(name).await?;
        if jobs.is_empty() {
            return Err(BatchError::EmptyBatch(name.to_string()));
        }
        if matches!(
            self.get_batch_state(name).await?,
            BatchState::Populated | BatchState::Prepared
        ) {
            self.set_state(name, BatchState::Running).await?;
        }

        let mut summary = RunSummary::default();
        'scan: loop {
            if self.is_stopped(name).await? {
                summary.stopped = true;
                break;
            }
            let mut pending = self.pending_jobs(name, jobs.len()).await?;
            if pending.is_empty() {
                break;
            }
            if options.randomize_order {
                pending.shuffle(&mut rand::thread_rng());
            }

            let mut claimed_any = false;
            for (index, stale) in pending {
                if options.max_jobs.is_some_and(|max| summary.ran() >= max) {
                    break 'scan;
                }
                if self.is_stopped(name).await? {
                    summary.stopped = true;
                    break 'scan;
                }
                let Some(claim) = self.try_claim(name, index, stale, &options.worker_label).await?
                else {
                    continue;
                };
                claimed_any = true;
                let progress = self.run_claimed(name, index, &jobs[index], claim).await?;
                summary.record(progress.outcome);
                on_job(&progress);
            }
            if !claimed_any {
                break;
            }
        }

        info!(
            batch.name = %name,
            worker = %options.worker_label,
            completed = summary.completed,
            errored = summary.errored,
            claims_lost = summary.claims_lost,
            stopped = summary.stopped,
            "batch run finished"
        );
        Ok(summary)
    }

    /// Jobs that are unclaimed, with the raw status of stale claims.
    async fn pending_jobs(
        &self,
        name: &str,
        count: usize,
    ) -> Result<Vec<(usize, Option<Value>)>, BatchError> {
        let now = Utc::now();
        let mut pending = Vec::new();
        for index in 0..count {
            match self
                .client()
                .get_latest_value(&status_key(name, index), None, None)
                .await?
            {
                None => pending.push((index, None)),
                Some(raw) => {
                    let record: JobStatusRecord = serde_json::from_value(raw.clone())?;
                    if record.is_stale(self.claim_stale, now) {
                        pending.push((index, Some(raw)));
                    }
                }
            }
        }
        Ok(pending)
    }

    async fn try_claim(
        &self,
        name: &str,
        index: usize,
        stale: Option<Value>,
        worker: &str,
    ) -> Result<Option<JobStatusRecord>, BatchError> {
        let claim = JobStatusRecord::claim(new_token(), worker.to_string());
        let value = serde_json::to_value(&claim)?;
        let key = status_key(name, index);
        let won = match stale {
            None => self.client().set_if_absent(&key, value).await?,
            Some(expected) => {
                let won = self
                    .client()
                    .compare_and_set(&key, Some(expected), Some(value))
                    .await?;
                if won {
                    warn!(batch.name = %name, job.index = index, "reclaimed stale job");
                }
                won
            }
        };
        if won {
            debug!(batch.name = %name, job.index = index, claim.token = %claim.token, "job claimed");
        }
        Ok(won.then_some(claim))
    }

    /// Run a claimed job, keeping the claim fresh while it runs, and record
    /// the outcome if the claim is still ours.
    async fn run_claimed(
        &self,
        name: &str,
        index: usize,
        job: &BatchJob,
        claim: JobStatusRecord,
    ) -> Result<JobProgress, BatchError> {
        let period = self.heartbeat_period();
        let mut heartbeats =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeats.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let execution = self.execute_job(name, index, job);
        tokio::pin!(execution);
        let mut current = claim;
        let mut claim_held = true;
        let execution = loop {
            tokio::select! {
                done = &mut execution => break done?,
                _ = heartbeats.tick(), if claim_held => {
                    match self.heartbeat(name, index, &current).await {
                        Ok(Some(refreshed)) => current = refreshed,
                        Ok(None) => {
                            warn!(batch.name = %name, job.index = index, "claim taken over while running");
                            claim_held = false;
                        }
                        Err(e) => {
                            warn!(batch.name = %name, job.index = index, error = %e, "heartbeat failed");
                        }
                    }
                }
            }
        };

        let mut done = current.clone();
        done.status = execution.status;
        done.fingerprint = execution.fingerprint;
        done.retcode = execution.retcode;
        done.error = execution.error;
        done.finished_at = Some(Utc::now());

        let recorded = self
            .client()
            .compare_and_set(
                &status_key(name, index),
                Some(serde_json::to_value(&current)?),
                Some(serde_json::to_value(&done)?),
            )
            .await?;

        let outcome = match (recorded, done.status) {
            (false, _) => {
                warn!(batch.name = %name, job.index = index, "claim lost before completion");
                JobOutcome::ClaimLost
            }
            (true, JobState::Complete) => JobOutcome::Complete,
            (true, _) => JobOutcome::Error,
        };
        info!(
            batch.name = %name,
            job.index = index,
            job.label = %job.label,
            job.status = %status_label(Some(&done)),
            "job finished"
        );
        Ok(JobProgress {
            index,
            label: job.label.clone(),
            outcome,
            retcode: done.retcode,
            from_cache: execution.from_cache,
        })
    }

    async fn execute_job(
        &self,
        name: &str,
        index: usize,
        job: &BatchJob,
    ) -> Result<Execution, BatchError> {
        let Some(processor) = self.registry.get(&job.command) else {
            return Ok(Execution::failed(format!("unknown command '{}'", job.command)));
        };
        info!(batch.name = %name, job.index = index, job.label = %job.label, "running job");
        let request = job.to_request(processor.spec());
        match self
            .cache
            .execute(processor.as_ref(), &request, ExecuteOptions::new())
            .await
        {
            Ok(result) => Ok(Execution {
                status: if result.succeeded() {
                    JobState::Complete
                } else {
                    JobState::Error
                },
                retcode: Some(result.retcode),
                fingerprint: Some(result.fingerprint),
                error: None,
                from_cache: result.from_cache,
            }),
            Err(JobError::Client(e)) if !e.is_not_found() => Err(BatchError::Coordination(e)),
            Err(e) => Ok(Execution::failed(e.to_string())),
        }
    }

    fn heartbeat_period(&self) -> Duration {
        (self.claim_stale / 4)
            .to_std()
            .unwrap_or(Duration::from_secs(60))
            .max(Duration::from_millis(10))
    }

    /// Refresh our claim. `None` when someone else holds the status now.
    async fn heartbeat(
        &self,
        name: &str,
        index: usize,
        current: &JobStatusRecord,
    ) -> Result<Option<JobStatusRecord>, BatchError> {
        let refreshed = JobStatusRecord {
            heartbeat_at: Some(Utc::now()),
            ..current.clone()
        };
        let won = self
            .client()
            .compare_and_set(
                &status_key(name, index),
                Some(serde_json::to_value(current)?),
                Some(serde_json::to_value(&refreshed)?),
            )
            .await?;
        debug!(batch.name = %name, job.index = index, won, "claim heartbeat");
        Ok(won.then_some(refreshed))
    }

    /// Ask every worker on the batch to stop after its current job.
    pub async fn stop_batch(&self, name: &str) -> Result<(), BatchError> {
        self.client()
            .set_value(&stop_key(name), None, Some(json!(true)), None)
            .await?;
        info!(batch.name = %name, "batch stop requested");
        Ok(())
    }

    pub async fn is_stopped(&self, name: &str) -> Result<bool, BatchError> {
        Ok(self
            .client()
            .get_latest_value(&stop_key(name), None, None)
            .await?
            == Some(json!(true)))
    }

    // ------------------------------------------------------------------
    // Results and introspection
    // ------------------------------------------------------------------

    pub async fn get_batch_job_statuses(
        &self,
        name: &str,
    ) -> Result<Vec<Option<JobStatusRecord>>, BatchError> {
        let count = self.get_batch_jobs(name).await?.len();
        let mut statuses = Vec::with_capacity(count);
        for index in 0..count {
            statuses.push(self.job_status(name, index).await?);
        }
        Ok(statuses)
    }

    async fn job_status(
        &self,
        name: &str,
        index: usize,
    ) -> Result<Option<JobStatusRecord>, BatchError> {
        match self
            .client()
            .get_latest_value(&status_key(name, index), None, None)
            .await?
        {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    /// Console text of a finished job, without re-running it.
    pub async fn get_batch_job_console_output(
        &self,
        name: &str,
        index: usize,
    ) -> Result<Option<String>, BatchError> {
        let count = self.get_batch_jobs(name).await?.len();
        if index >= count {
            return Err(BatchError::NoSuchJob {
                batch: name.to_string(),
                index,
            });
        }
        let Some(status) = self.job_status(name, index).await? else {
            return Ok(None);
        };
        if let Some(fingerprint) = &status.fingerprint {
            if let Some(result) = self.cache.lookup(fingerprint).await? {
                return Ok(Some(result.console_output));
            }
        }
        Ok(status.error)
    }

    /// Gather every job's result into one stored document.
    pub async fn assemble_batch(&self, name: &str) -> Result<BatchResults, BatchError> {
        let jobs = self.get_batch_jobs(name).await?;
        if jobs.is_empty() {
            return Err(BatchError::EmptyBatch(name.to_string()));
        }
        let statuses = self.get_batch_job_statuses(name).await?;
        let pending = statuses
            .iter()
            .filter(|s| !s.as_ref().is_some_and(JobStatusRecord::is_finished))
            .count();
        if pending > 0 {
            return Err(BatchError::Incomplete {
                batch: name.to_string(),
                pending,
            });
        }

        let mut results = Vec::with_capacity(jobs.len());
        for (job, status) in jobs.iter().zip(statuses.iter().flatten()) {
            let cached = match &status.fingerprint {
                Some(fp) => self.cache.lookup(fp).await?,
                None => None,
            };
            results.push(BatchJobResult {
                label: job.label.clone(),
                command: job.command.clone(),
                status: status.to_string(),
                fingerprint: status.fingerprint.clone(),
                retcode: cached
                    .as_ref()
                    .map(|r| r.retcode)
                    .or(status.retcode)
                    .unwrap_or(1),
                result: cached.as_ref().map(|r| r.result.clone()).unwrap_or_default(),
                outputs: cached.as_ref().map(|r| r.outputs.clone()).unwrap_or_default(),
                elapsed_secs: cached.map(|r| r.runtime_info.elapsed_secs),
            });
        }

        let assembled = BatchResults {
            batch: name.to_string(),
            assembled_at: Utc::now(),
            results,
        };
        self.client()
            .set_value(&results_key(name), None, Some(serde_json::to_value(&assembled)?), None)
            .await?;
        self.set_state(name, BatchState::Assembled).await?;
        info!(batch.name = %name, batch.jobs = jobs.len(), "batch assembled");
        Ok(assembled)
    }

    pub async fn get_batch_results(&self, name: &str) -> Result<BatchResults, BatchError> {
        match self.client().get_latest_value(&results_key(name), None, None).await? {
            Some(v) => Ok(serde_json::from_value(v)?),
            None => Err(BatchError::NotAssembled(name.to_string())),
        }
    }

    pub async fn batch_summary(&self, name: &str) -> Result<BatchSummary, BatchError> {
        let mut summary = BatchSummary {
            name: name.to_string(),
            state: Some(self.get_batch_state(name).await?),
            ..BatchSummary::default()
        };
        for status in self.get_batch_job_statuses(name).await? {
            summary.count(status.as_ref());
        }
        Ok(summary)
    }

    /// Summaries of every batch set through this store.
    pub async fn list_batch_summary(&self) -> Result<Vec<BatchSummary>, BatchError> {
        let names = self.client().get_latest_subkeys(&index_key()).await?;
        let mut summaries = Vec::with_capacity(names.len());
        for name in names {
            summaries.push(self.batch_summary(&name).await?);
        }
        Ok(summaries)
    }

    // ------------------------------------------------------------------
    // Cleanup
    // ------------------------------------------------------------------

    /// Remove the batch and everything recorded about it. Cached job
    /// results stay, so re-running the same jobs is cheap.
    pub async fn clear_batch(&self, name: &str) -> Result<(), BatchError> {
        self.forget_progress(name).await?;
        let client = self.client();
        client.set_value(&jobs_key(name), None, None, None).await?;
        client.set_value(&state_key(name), None, None, None).await?;
        client.set_value(&index_key(), Some(name), None, None).await?;
        info!(batch.name = %name, "batch cleared");
        Ok(())
    }

    /// Drop statuses, results and the stop flag.
    async fn forget_progress(&self, name: &str) -> Result<(), BatchError> {
        let count = self.get_batch_jobs(name).await?.len();
        let client = self.client();
        for index in 0..count {
            client.set_value(&status_key(name, index), None, None, None).await?;
        }
        client.set_value(&results_key(name), None, None, None).await?;
        client.set_value(&stop_key(name), None, None, None).await?;
        Ok(())
    }
}

fn new_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect()
}
