use std::time::Duration;

use crate::execution::{CommandSpec, ProcessSpawnRequest};
use crate::models::{
    AdapterDescriptor, AdapterOptions, CoreError, CoreErrorKind, TaskId, ToolResult, WorkflowId,
};
use crate::orchestration::TaskCancellationToken;

pub type AdapterResult<T> = Result<T, CoreError>;

/// One invocation of an adapter on behalf of a workflow task.
#[derive(Clone, Debug)]
pub struct AdapterRequest {
    pub workflow: WorkflowId,
    pub task: TaskId,
    pub target: String,
    pub options: AdapterOptions,
    pub timeout: Duration,
    pub cancellation: TaskCancellationToken,
}

impl AdapterRequest {
    pub fn new(workflow: WorkflowId, task: TaskId, target: impl Into<String>) -> Self {
        Self {
            workflow,
            task,
            target: target.into(),
            options: AdapterOptions::new(),
            timeout: Duration::from_secs(600),
            cancellation: TaskCancellationToken::new(),
        }
    }

    pub fn options(mut self, options: AdapterOptions) -> Self {
        self.options = options;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn cancellation(mut self, cancellation: TaskCancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn string_option(&self, name: &str) -> Option<&str> {
        self.options
            .get(name)
            .and_then(serde_json::Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn integer_option(&self, name: &str) -> Option<i64> {
        self.options.get(name).and_then(serde_json::Value::as_i64)
    }

    pub fn bool_option(&self, name: &str) -> bool {
        self.options
            .get(name)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }

    pub fn string_list_option(&self, name: &str) -> Vec<String> {
        self.options
            .get(name)
            .and_then(serde_json::Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(serde_json::Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The named option when set, otherwise the workflow target.
    pub fn target_or(&self, option: &str) -> &str {
        self.string_option(option).unwrap_or(self.target.as_str())
    }

    pub fn spawn_request(&self, adapter: &str, command: CommandSpec) -> ProcessSpawnRequest {
        ProcessSpawnRequest::new(adapter, command)
            .workflow(self.workflow)
            .task(self.task.clone())
            .timeout(self.timeout)
    }

    pub fn ensure_not_cancelled(&self, adapter: &str) -> AdapterResult<()> {
        if self.cancellation.is_cancelled() {
            return Err(CoreError::new(CoreErrorKind::Cancelled, "adapter call was cancelled")
                .with_adapter(adapter)
                .with_workflow(self.workflow)
                .with_task(self.task.clone()));
        }
        Ok(())
    }
}

/// A security tool behind the engine's fixed contract.
///
/// Implementations are shared across tasks and workflows and run on blocking
/// pool threads, so `execute` may block but must be safe to call concurrently.
pub trait ToolAdapter: Send + Sync {
    fn descriptor(&self) -> &AdapterDescriptor;

    fn validate_options(&self, options: &AdapterOptions) -> AdapterResult<()> {
        validate_against_descriptor(self.descriptor(), options)
    }

    fn execute(&self, request: AdapterRequest) -> AdapterResult<ToolResult>;
}

pub fn validate_against_descriptor(
    descriptor: &AdapterDescriptor,
    options: &AdapterOptions,
) -> AdapterResult<()> {
    for spec in descriptor.options.iter().filter(|spec| spec.required) {
        if !options.contains_key(spec.name) {
            return Err(invalid_options(
                descriptor,
                format!("missing required option '{}'", spec.name),
            ));
        }
    }

    for (key, value) in options {
        let Some(spec) = descriptor.option(key) else {
            return Err(invalid_options(descriptor, format!("unknown option '{key}'")));
        };
        if !spec.kind.matches(value) {
            return Err(invalid_options(
                descriptor,
                format!("option '{key}' must be a {}", spec.kind.as_str()),
            ));
        }
    }

    Ok(())
}

fn invalid_options(descriptor: &AdapterDescriptor, message: String) -> CoreError {
    CoreError::new(CoreErrorKind::InvalidOptions, message).with_adapter(descriptor.name)
}
