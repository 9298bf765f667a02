use std::collections::BTreeSet;
use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::models::{FindingsSummary, TaskId, TaskRecord, TaskStatus};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(pub u64);

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Created,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = ();

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(()),
        }
    }
}

/// The workflow aggregate: header plus its insertion-ordered tasks.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkflowRecord {
    pub id: WorkflowId,
    pub name: String,
    pub description: String,
    pub target: String,
    pub status: WorkflowStatus,
    pub created_at: SystemTime,
    pub started_at: Option<SystemTime>,
    pub finished_at: Option<SystemTime>,
    pub tasks: Vec<TaskRecord>,
    pub tags: BTreeSet<String>,
    pub findings_summary: FindingsSummary,
    pub error_message: Option<String>,
}

impl WorkflowRecord {
    pub fn new(
        id: WorkflowId,
        name: impl Into<String>,
        description: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            description: description.into(),
            target: target.into(),
            status: WorkflowStatus::Created,
            created_at: SystemTime::now(),
            started_at: None,
            finished_at: None,
            tasks: Vec::new(),
            tags: BTreeSet::new(),
            findings_summary: FindingsSummary::new(),
            error_message: None,
        }
    }

    pub fn task(&self, task_id: &TaskId) -> Option<&TaskRecord> {
        self.tasks.iter().find(|task| &task.id == task_id)
    }

    pub fn task_mut(&mut self, task_id: &TaskId) -> Option<&mut TaskRecord> {
        self.tasks.iter_mut().find(|task| &task.id == task_id)
    }

    pub fn count_tasks(&self, status: TaskStatus) -> usize {
        self.tasks
            .iter()
            .filter(|task| task.status == status)
            .count()
    }

    pub fn status_report(&self) -> WorkflowStatusReport {
        WorkflowStatusReport {
            workflow_id: self.id,
            status: self.status,
            task_count: self.tasks.len(),
            pending_count: self.count_tasks(TaskStatus::Pending),
            running_count: self.count_tasks(TaskStatus::Running),
            completed_count: self.count_tasks(TaskStatus::Completed),
            failed_count: self.count_tasks(TaskStatus::Failed),
            skipped_count: self.count_tasks(TaskStatus::Skipped),
            findings_summary: self.findings_summary.clone(),
        }
    }

    pub fn summary(&self) -> WorkflowSummary {
        WorkflowSummary {
            id: self.id,
            name: self.name.clone(),
            target: self.target.clone(),
            status: self.status,
            task_count: self.tasks.len(),
            created_at: self.created_at,
            tags: self.tags.clone(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct WorkflowStatusReport {
    pub workflow_id: WorkflowId,
    pub status: WorkflowStatus,
    pub task_count: usize,
    pub pending_count: usize,
    pub running_count: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
    pub findings_summary: FindingsSummary,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WorkflowSummary {
    pub id: WorkflowId,
    pub name: String,
    pub target: String,
    pub status: WorkflowStatus,
    pub task_count: usize,
    pub created_at: SystemTime,
    pub tags: BTreeSet<String>,
}
