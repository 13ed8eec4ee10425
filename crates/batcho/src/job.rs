//! Batch data as stored in the key/value store.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use kvstore::Key;
use mlprocessors::{JobRequest, ProcessorSpec};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// One entry of a batch: a command plus its parameters and inputs.
///
/// Any field other than `command` and `label` is passed to the command;
/// fields naming an input slot are file references, the rest parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    pub command: String,
    #[serde(default)]
    pub label: String,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl BatchJob {
    pub fn new(command: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            label: label.into(),
            params: Map::new(),
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Split params into a request for `spec`.
    pub fn to_request(&self, spec: &ProcessorSpec) -> JobRequest {
        let mut request = JobRequest::new();
        for (name, value) in &self.params {
            let is_input = spec.inputs.iter().any(|s| &s.name == name);
            match (is_input, value) {
                (true, Value::String(reference)) => {
                    request.inputs.insert(name.clone(), reference.clone());
                }
                _ => {
                    request.parameters.insert(name.clone(), value.clone());
                }
            }
        }
        request
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BatchState {
    Empty,
    Populated,
    Preparing,
    Prepared,
    Running,
    Assembled,
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchState::Empty => "empty",
            BatchState::Populated => "populated",
            BatchState::Preparing => "preparing",
            BatchState::Prepared => "prepared",
            BatchState::Running => "running",
            BatchState::Assembled => "assembled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    InProcess,
    Complete,
    Error,
}

/// Per-job status. Absent means not started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusRecord {
    pub status: JobState,
    /// Random per-claim token.
    pub token: String,
    #[serde(default)]
    pub worker: String,
    pub claimed_at: DateTime<Utc>,
    /// Last time the owning worker showed it was still alive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retcode: Option<i32>,
    /// Why the job never produced a result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobStatusRecord {
    pub fn claim(token: String, worker: String) -> Self {
        Self {
            status: JobState::InProcess,
            token,
            worker,
            claimed_at: Utc::now(),
            heartbeat_at: None,
            finished_at: None,
            fingerprint: None,
            retcode: None,
            error: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, JobState::Complete | JobState::Error)
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        self.heartbeat_at.unwrap_or(self.claimed_at)
    }

    /// An in-process claim whose worker has gone quiet for `stale_after`.
    pub fn is_stale(&self, stale_after: chrono::Duration, now: DateTime<Utc>) -> bool {
        self.status == JobState::InProcess && now - self.last_seen() > stale_after
    }
}

impl fmt::Display for JobStatusRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            JobState::InProcess => write!(f, "in-process-{}", self.token),
            JobState::Complete => f.write_str("complete"),
            JobState::Error => write!(f, "error-{}", self.token),
        }
    }
}

/// Display form of an optional status.
pub fn status_label(status: Option<&JobStatusRecord>) -> String {
    status.map_or_else(|| "not-started".to_string(), ToString::to_string)
}

/// Counts of job statuses in one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub name: String,
    pub state: Option<BatchState>,
    pub total: usize,
    pub not_started: usize,
    pub in_process: usize,
    pub complete: usize,
    pub error: usize,
}

impl BatchSummary {
    pub fn count(&mut self, status: Option<&JobStatusRecord>) {
        self.total += 1;
        match status.map(|s| s.status) {
            None => self.not_started += 1,
            Some(JobState::InProcess) => self.in_process += 1,
            Some(JobState::Complete) => self.complete += 1,
            Some(JobState::Error) => self.error += 1,
        }
    }

    pub fn finished(&self) -> usize {
        self.complete + self.error
    }
}

/// One job's entry in an assembled batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJobResult {
    pub label: String,
    pub command: String,
    pub status: String,
    #[serde(default)]
    pub fingerprint: Option<String>,
    pub retcode: i32,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    #[serde(default)]
    pub elapsed_secs: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResults {
    pub batch: String,
    pub assembled_at: DateTime<Utc>,
    pub results: Vec<BatchJobResult>,
}

pub(crate) fn jobs_key(batch: &str) -> Key {
    json!({"batcho": "batch_jobs", "batch": batch}).into()
}

pub(crate) fn state_key(batch: &str) -> Key {
    json!({"batcho": "batch_state", "batch": batch}).into()
}

pub(crate) fn status_key(batch: &str, index: usize) -> Key {
    json!({"batcho": "job_status", "batch": batch, "index": index}).into()
}

pub(crate) fn results_key(batch: &str) -> Key {
    json!({"batcho": "batch_results", "batch": batch}).into()
}

pub(crate) fn stop_key(batch: &str) -> Key {
    json!({"batcho": "stop", "batch": batch}).into()
}

/// Subkeys name every batch set through this store.
pub(crate) fn index_key() -> Key {
    json!({"batcho": "batch_index"}).into()
}
