pub mod adapter;
pub mod error;
pub mod finding;
pub mod task;
pub mod workflow;

pub use adapter::{AdapterDescriptor, OptionKind, OptionSpec, ToolCategory};
pub use error::{CoreError, CoreErrorKind};
pub use finding::{ExportedFinding, Finding, FindingsSummary, Severity, ToolResult, ToolStatus};
pub use task::{AdapterOptions, NewTask, SkipReason, TaskError, TaskId, TaskRecord, TaskStatus};
pub use workflow::{
    WorkflowId, WorkflowRecord, WorkflowStatus, WorkflowStatusReport, WorkflowSummary,
};
