//! Processors backed by external programs, declared in configuration.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use mtconfig::CommandConfig;
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use crate::processor::{ExitCode, JobContext, Processor};
use crate::spec::{ParamSpec, ProcessorSpec, SlotSpec};

/// Runs `config.command` with `{name}` placeholders filled in.
///
/// The schema is derived from the placeholders: names listed as inputs or
/// outputs become file slots, the rest are required parameters of any JSON
/// type. Stdout parsed as JSON (or the raw text) becomes the job result.
#[derive(Debug, Clone)]
pub struct CommandProcessor {
    spec: ProcessorSpec,
    template: Vec<String>,
}

impl CommandProcessor {
    pub fn from_config(name: &str, config: &CommandConfig) -> Self {
        let template: Vec<String> = config
            .command
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let mut spec = ProcessorSpec::new(name, config.version.clone());
        for slot in &config.inputs {
            spec = spec.input(SlotSpec::required(slot.clone()));
        }
        for slot in &config.outputs {
            spec = spec.output(SlotSpec::required(slot.clone()));
        }
        let mut seen = Vec::new();
        for token in &template {
            for placeholder in placeholders(token) {
                let is_slot = config.inputs.iter().chain(&config.outputs).any(|s| s == placeholder);
                if !is_slot && !seen.iter().any(|s: &String| s == placeholder) {
                    seen.push(placeholder.to_string());
                    spec = spec.parameter(ParamSpec::json(placeholder));
                }
            }
        }

        Self { spec, template }
    }

    /// The argv for a job, placeholders substituted.
    fn argv(&self, ctx: &JobContext) -> anyhow::Result<Vec<String>> {
        self.template
            .iter()
            .map(|token| {
                let mut out = token.clone();
                for name in placeholders(token) {
                    let replacement = lookup(ctx, name)
                        .ok_or_else(|| anyhow::anyhow!("no value for placeholder {{{}}}", name))?;
                    out = out.replace(&format!("{{{}}}", name), &replacement);
                }
                Ok(out)
            })
            .collect()
    }
}

fn lookup(ctx: &JobContext, name: &str) -> Option<String> {
    if let Some(path) = ctx.input_path(name).or_else(|| ctx.output_path(name)) {
        return Some(path_arg(path));
    }
    ctx.param(name).map(|v| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// `{name}` occurrences in a token.
fn placeholders(token: &str) -> Vec<&str> {
    let mut found = Vec::new();
    let mut rest = token;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            break;
        };
        let name = &after[..close];
        if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            found.push(name);
        }
        rest = &after[close + 1..];
    }
    found
}

#[async_trait]
impl Processor for CommandProcessor {
    fn spec(&self) -> &ProcessorSpec {
        &self.spec
    }

    async fn run(&self, ctx: &mut JobContext) -> anyhow::Result<Value> {
        let argv = self.argv(ctx)?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("command for {} is empty", self.spec.name))?;
        debug!(command = %argv.join(" "), "spawning command");

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| anyhow::anyhow!("failed to spawn {}: {}", program, e))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        let console = ctx.console();
        console.push_str(&stdout);
        console.push_str(&stderr);

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            writeln!(console, "{} exited with code {}", program, code)?;
            return Err(ExitCode(code).into());
        }

        let trimmed = stdout.trim();
        Ok(serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string())))
    }
}

/// Processors for every configured command.
pub fn command_processors(
    commands: &BTreeMap<String, CommandConfig>,
) -> impl Iterator<Item = CommandProcessor> + '_ {
    commands
        .iter()
        .map(|(name, config)| CommandProcessor::from_config(name, config))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(command: &str, inputs: &[&str], outputs: &[&str]) -> CommandConfig {
        CommandConfig {
            command: command.to_string(),
            version: "1.0".to_string(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders("{a}"), vec!["a"]);
        assert_eq!(placeholders("--n={x}:{y_2}"), vec!["x", "y_2"]);
        assert!(placeholders("{}").is_empty());
        assert!(placeholders("{not closed").is_empty());
        assert!(placeholders("{a b}").is_empty());
    }

    #[test]
    fn test_spec_from_placeholders() {
        let p = CommandProcessor::from_config(
            "sorter",
            &config("sort {raw} {out} --n {x} --m {x}", &["raw"], &["out"]),
        );
        let spec = p.spec();
        assert_eq!(spec.name, "sorter");
        assert_eq!(spec.version, "1.0");
        assert_eq!(spec.inputs.len(), 1);
        assert_eq!(spec.outputs.len(), 1);
        assert_eq!(spec.parameters.len(), 1);
        assert!(spec.param("x").is_some());
    }

    #[test]
    fn test_argv_substitution() {
        let p = CommandProcessor::from_config("c", &config("prog {raw} --n={x} {label}", &["raw"], &[]));
        let ctx = JobContext::new(
            BTreeMap::from([
                ("x".to_string(), serde_json::json!(3)),
                ("label".to_string(), serde_json::json!("hi")),
            ]),
            BTreeMap::from([("raw".to_string(), "/data/raw.mda".into())]),
            BTreeMap::new(),
        );
        assert_eq!(p.argv(&ctx).unwrap(), vec!["prog", "/data/raw.mda", "--n=3", "hi"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_command_and_parses_stdout() {
        let p = CommandProcessor::from_config("echo", &config("echo {x}", &[], &[]));
        let mut ctx = JobContext::new(
            BTreeMap::from([("x".to_string(), serde_json::json!({"a": 1}))]),
            BTreeMap::new(),
            BTreeMap::new(),
        );
        let value = p.run(&mut ctx).await.unwrap();
        assert_eq!(value, serde_json::json!({"a": 1}));
        assert!(ctx.console_output().contains("{\"a\":1}"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_exit_code() {
        let p = CommandProcessor::from_config("false", &config("false", &[], &[]));
        let mut ctx = JobContext::default();
        let err = p.run(&mut ctx).await.unwrap_err();
        assert_eq!(err.downcast_ref::<ExitCode>(), Some(&ExitCode(1)));
    }
}
