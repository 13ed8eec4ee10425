//! The processor contract and the context a processor runs in.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::spec::ProcessorSpec;

/// An invocable unit of work with a declared schema.
#[async_trait]
pub trait Processor: Send + Sync {
    fn spec(&self) -> &ProcessorSpec;

    /// Run with validated parameters. Text written to `ctx.console()` ends
    /// up in the job's console output; the returned value is the job result.
    async fn run(&self, ctx: &mut JobContext) -> anyhow::Result<Value>;
}

/// Non-zero exit reported by a processor. The code becomes the job's retcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("processor exited with code {0}")]
pub struct ExitCode(pub i32);

/// What a running processor sees.
#[derive(Debug, Default)]
pub struct JobContext {
    parameters: BTreeMap<String, Value>,
    inputs: BTreeMap<String, PathBuf>,
    outputs: BTreeMap<String, PathBuf>,
    console: String,
}

impl JobContext {
    pub fn new(
        parameters: BTreeMap<String, Value>,
        inputs: BTreeMap<String, PathBuf>,
        outputs: BTreeMap<String, PathBuf>,
    ) -> Self {
        Self {
            parameters,
            inputs,
            outputs,
            console: String::new(),
        }
    }

    pub fn parameters(&self) -> &BTreeMap<String, Value> {
        &self.parameters
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }

    /// Realized local path of an input slot.
    pub fn input_path(&self, slot: &str) -> Option<&Path> {
        self.inputs.get(slot).map(PathBuf::as_path)
    }

    pub fn inputs(&self) -> &BTreeMap<String, PathBuf> {
        &self.inputs
    }

    /// Where the processor must write an output slot.
    pub fn output_path(&self, slot: &str) -> Option<&Path> {
        self.outputs.get(slot).map(PathBuf::as_path)
    }

    pub fn outputs(&self) -> &BTreeMap<String, PathBuf> {
        &self.outputs
    }

    /// Captured console text; use with `write!`/`writeln!`.
    pub fn console(&mut self) -> &mut String {
        &mut self.console
    }

    pub fn console_output(&self) -> &str {
        &self.console
    }

    pub(crate) fn into_console(self) -> String {
        self.console
    }
}

/// Processors by name.
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn Processor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under the processor's declared name, replacing any previous one.
    pub fn register(&mut self, processor: Arc<dyn Processor>) {
        let name = processor.spec().name.clone();
        self.register_as(name, processor);
    }

    /// Register under an alias (batch command names need not match processor names).
    pub fn register_as(&mut self, name: impl Into<String>, processor: Arc<dyn Processor>) {
        self.processors.insert(name.into(), processor);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Processor>> {
        self.processors.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.processors.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.processors.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("processors", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fmt::Write;

    struct Echo(ProcessorSpec);

    #[async_trait]
    impl Processor for Echo {
        fn spec(&self) -> &ProcessorSpec {
            &self.0
        }

        async fn run(&self, ctx: &mut JobContext) -> anyhow::Result<Value> {
            let value = ctx.param("x").cloned().unwrap_or(Value::Null);
            writeln!(ctx.console(), "echo {}", value)?;
            Ok(value)
        }
    }

    #[tokio::test]
    async fn test_context_console_capture() {
        let echo = Echo(ProcessorSpec::new("echo", "1"));
        let mut ctx = JobContext::new(
            BTreeMap::from([("x".to_string(), json!(5))]),
            BTreeMap::new(),
            BTreeMap::new(),
        );
        assert_eq!(echo.run(&mut ctx).await.unwrap(), json!(5));
        assert_eq!(ctx.console_output(), "echo 5\n");
    }

    #[test]
    fn test_registry_alias() {
        let mut registry = ProcessorRegistry::new();
        registry.register(Arc::new(Echo(ProcessorSpec::new("echo", "1"))));
        registry.register_as("cmd1", Arc::new(Echo(ProcessorSpec::new("echo", "2"))));

        assert_eq!(registry.names(), vec!["cmd1".to_string(), "echo".to_string()]);
        assert_eq!(registry.get("cmd1").unwrap().spec().version, "2");
        assert!(registry.get("missing").is_none());
    }
}
