pub mod cancellation;
pub(crate) mod executor;
pub mod graph;
pub mod orchestrator;

pub use cancellation::{CancellationMode, TaskCancellationToken};
pub use graph::DependencyGraph;
pub use orchestrator::Orchestrator;

use crate::models::CoreError;

pub type OrchestrationResult<T> = Result<T, CoreError>;
