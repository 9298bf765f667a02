use crate::models::{CoreError, TaskRecord, WorkflowId, WorkflowRecord};

pub type PersistenceResult<T> = Result<T, CoreError>;

pub trait MigrationStore: Send + Sync {
    fn current_version(&self) -> PersistenceResult<i64>;

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()>;
}

/// Durable home for workflow aggregates.
///
/// Implementations are synchronous; the orchestrator calls them from the
/// blocking pool.
pub trait WorkflowStore: Send + Sync {
    /// Writes the header and every task in one transaction.
    fn create_workflow(&self, workflow: &WorkflowRecord) -> PersistenceResult<()>;

    /// Writes header fields only (status, timestamps, tags, error).
    fn update_workflow(&self, workflow: &WorkflowRecord) -> PersistenceResult<()>;

    fn upsert_task(&self, workflow: WorkflowId, task: &TaskRecord) -> PersistenceResult<()>;

    /// Every stored workflow with its tasks in insertion order.
    fn load_workflows(&self) -> PersistenceResult<Vec<WorkflowRecord>>;

    fn next_workflow_id(&self) -> PersistenceResult<WorkflowId>;
}
