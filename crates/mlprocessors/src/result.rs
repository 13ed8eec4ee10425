//! Job requests and results.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Parameters plus input references (`sha1://`, `key://` or local paths).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
}

impl JobRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn input(mut self, slot: impl Into<String>, reference: impl Into<String>) -> Self {
        self.inputs.insert(slot.into(), reference.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteOptions {
    /// Run even when a cached result exists.
    #[serde(default)]
    pub force_run: bool,
    /// Record failures as results instead of returning errors.
    #[serde(default = "default_true")]
    pub skip_failing: bool,
}

fn default_true() -> bool {
    true
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self {
            force_run: false,
            skip_failing: true,
        }
    }

    pub fn force_run(mut self) -> Self {
        self.force_run = true;
        self
    }

    pub fn fail_fast(mut self) -> Self {
        self.skip_failing = false;
        self
    }
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub elapsed_secs: f64,
}

impl RuntimeInfo {
    pub fn between(start_time: DateTime<Utc>, end_time: DateTime<Utc>) -> Self {
        let elapsed_secs = (end_time - start_time)
            .num_microseconds()
            .map(|us| us as f64 / 1e6)
            .unwrap_or_default();
        Self {
            start_time,
            end_time,
            elapsed_secs,
        }
    }
}

/// Outcome of one execution. Immutable once cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub fingerprint: String,
    pub processor_name: String,
    pub processor_version: String,
    pub retcode: i32,
    pub console_output: String,
    pub runtime_info: RuntimeInfo,
    /// Output slot name -> `sha1://` address.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    /// Value returned by the processor body (`null` on failure).
    #[serde(default)]
    pub result: Value,
    /// Set on results served from the cache; never persisted.
    #[serde(default, skip_serializing)]
    pub from_cache: bool,
}

impl JobResult {
    pub fn succeeded(&self) -> bool {
        self.retcode == 0
    }
}
