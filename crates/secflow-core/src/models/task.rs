use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::models::{CoreErrorKind, ToolResult};

pub type AdapterOptions = BTreeMap<String, serde_json::Value>;

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = ();

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(()),
        }
    }
}

/// Why a task failed. Adapter failures keep the adapter's own kind.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TaskError {
    pub kind: CoreErrorKind,
    pub message: String,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    DependencyFailed { dependency: TaskId },
    WorkflowCancelled,
    Interrupted,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TaskRecord {
    pub id: TaskId,
    pub adapter: String,
    pub options: AdapterOptions,
    pub depends_on: BTreeSet<TaskId>,
    pub status: TaskStatus,
    pub result: Option<ToolResult>,
    pub error: Option<TaskError>,
    pub skip_reason: Option<SkipReason>,
    pub created_at: SystemTime,
    pub started_at: Option<SystemTime>,
    pub finished_at: Option<SystemTime>,
}

impl TaskRecord {
    pub fn pending(
        id: TaskId,
        adapter: impl Into<String>,
        options: AdapterOptions,
        depends_on: BTreeSet<TaskId>,
    ) -> Self {
        Self {
            id,
            adapter: adapter.into(),
            options,
            depends_on,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            skip_reason: None,
            created_at: SystemTime::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn mark_running(&mut self, at: SystemTime) {
        self.status = TaskStatus::Running;
        self.started_at = Some(at);
    }

    pub fn mark_completed(&mut self, result: ToolResult, at: SystemTime) {
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.finished_at = Some(at);
    }

    pub fn mark_failed(&mut self, result: Option<ToolResult>, error: TaskError, at: SystemTime) {
        self.status = TaskStatus::Failed;
        self.result = result;
        self.error = Some(error);
        self.finished_at = Some(at);
    }

    pub fn mark_skipped(&mut self, reason: SkipReason, at: SystemTime) {
        self.status = TaskStatus::Skipped;
        self.skip_reason = Some(reason);
        self.finished_at = Some(at);
    }
}

/// Caller input for adding a task to a workflow.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NewTask {
    pub id: Option<TaskId>,
    pub adapter: String,
    pub options: AdapterOptions,
    pub depends_on: Vec<TaskId>,
}

impl NewTask {
    pub fn new(adapter: impl Into<String>) -> Self {
        Self {
            adapter: adapter.into(),
            ..Self::default()
        }
    }

    pub fn id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn option(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn options(mut self, options: AdapterOptions) -> Self {
        self.options.extend(options);
        self
    }

    pub fn depends_on(mut self, dependency: impl Into<TaskId>) -> Self {
        self.depends_on.push(dependency.into());
        self
    }
}
