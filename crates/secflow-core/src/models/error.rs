use crate::models::{TaskId, WorkflowId};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CoreErrorKind {
    AlreadyRegistered,
    NotFound,
    UnknownAdapter,
    InvalidOptions,
    CyclicDependency,
    InvalidInput,
    InvalidState,
    AlreadyRunning,
    NotInstalled,
    ParseFailure,
    ProcessFailure,
    Timeout,
    Cancelled,
    Interrupted,
    StorageFailure,
    Internal,
}

impl CoreErrorKind {
    /// Errors raised before anything is created or run.
    pub fn is_validation(self) -> bool {
        matches!(
            self,
            Self::UnknownAdapter
                | Self::InvalidOptions
                | Self::CyclicDependency
                | Self::InvalidInput
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AlreadyRegistered => "already_registered",
            Self::NotFound => "not_found",
            Self::UnknownAdapter => "unknown_adapter",
            Self::InvalidOptions => "invalid_options",
            Self::CyclicDependency => "cyclic_dependency",
            Self::InvalidInput => "invalid_input",
            Self::InvalidState => "invalid_state",
            Self::AlreadyRunning => "already_running",
            Self::NotInstalled => "not_installed",
            Self::ParseFailure => "parse_failure",
            Self::ProcessFailure => "process_failure",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Interrupted => "interrupted",
            Self::StorageFailure => "storage_failure",
            Self::Internal => "internal",
        }
    }
}

impl std::str::FromStr for CoreErrorKind {
    type Err = ();

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        const ALL: [CoreErrorKind; 16] = [
            CoreErrorKind::AlreadyRegistered,
            CoreErrorKind::NotFound,
            CoreErrorKind::UnknownAdapter,
            CoreErrorKind::InvalidOptions,
            CoreErrorKind::CyclicDependency,
            CoreErrorKind::InvalidInput,
            CoreErrorKind::InvalidState,
            CoreErrorKind::AlreadyRunning,
            CoreErrorKind::NotInstalled,
            CoreErrorKind::ParseFailure,
            CoreErrorKind::ProcessFailure,
            CoreErrorKind::Timeout,
            CoreErrorKind::Cancelled,
            CoreErrorKind::Interrupted,
            CoreErrorKind::StorageFailure,
            CoreErrorKind::Internal,
        ];
        ALL.into_iter().find(|kind| kind.as_str() == raw).ok_or(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct CoreError {
    pub workflow: Option<WorkflowId>,
    pub task: Option<TaskId>,
    pub adapter: Option<String>,
    pub kind: CoreErrorKind,
    pub message: String,
}

impl CoreError {
    pub fn new(kind: CoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            workflow: None,
            task: None,
            adapter: None,
            kind,
            message: message.into(),
        }
    }

    pub fn with_workflow(mut self, workflow: WorkflowId) -> Self {
        self.workflow = Some(workflow);
        self
    }

    pub fn with_task(mut self, task: TaskId) -> Self {
        self.task = Some(task);
        self
    }

    pub fn with_adapter(mut self, adapter: impl Into<String>) -> Self {
        self.adapter = Some(adapter.into());
        self
    }

    /// Fills in attribution the error does not already carry.
    pub fn attributed(
        self,
        workflow: WorkflowId,
        task: Option<&TaskId>,
        adapter: Option<&str>,
    ) -> Self {
        Self {
            workflow: self.workflow.or(Some(workflow)),
            task: self.task.or_else(|| task.cloned()),
            adapter: self.adapter.or_else(|| adapter.map(str::to_string)),
            kind: self.kind,
            message: self.message,
        }
    }
}
