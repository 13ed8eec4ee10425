use std::collections::BTreeMap;
use std::sync::Arc;

use mlprocessors::{CommandProcessor, Processor, ProcessorRegistry};
use mtconfig::CommandConfig;

/// Batch command names mapped to processors.
#[derive(Debug, Clone, Default)]
pub struct CommandRegistry {
    processors: ProcessorRegistry,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every `[commands]` entry as an external-program processor.
    pub fn with_commands(mut self, commands: &BTreeMap<String, CommandConfig>) -> Self {
        for (name, config) in commands {
            self.register(name.clone(), Arc::new(CommandProcessor::from_config(name, config)));
        }
        self
    }

    pub fn register(&mut self, command: impl Into<String>, processor: Arc<dyn Processor>) {
        self.processors.register_as(command, processor);
    }

    pub fn get(&self, command: &str) -> Option<Arc<dyn Processor>> {
        self.processors.get(command)
    }

    pub fn names(&self) -> Vec<String> {
        self.processors.names()
    }
}
