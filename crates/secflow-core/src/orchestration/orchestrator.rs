use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime};

use tokio::sync::{Mutex, Notify, Semaphore};

use crate::adapters::ToolAdapter;
use crate::aggregation;
use crate::config::OrchestratorConfig;
use crate::models::{
    CoreError, CoreErrorKind, ExportedFinding, NewTask, SkipReason, TaskError, TaskId, TaskRecord,
    WorkflowId, WorkflowRecord, WorkflowStatus, WorkflowStatusReport, WorkflowSummary,
};
use crate::orchestration::executor::{self, PlannedTask, RunPlan};
use crate::orchestration::{
    CancellationMode, DependencyGraph, OrchestrationResult, TaskCancellationToken,
};
use crate::persistence::WorkflowStore;
use crate::registry::AdapterRegistry;
use crate::templates::{TemplateLibrary, TemplateOverrides, TemplateSummary};

/// Shared state for one workflow: the aggregate plus its run controls.
pub(crate) struct WorkflowEntry {
    pub(crate) id: WorkflowId,
    record: RwLock<WorkflowRecord>,
    run_lock: Arc<Mutex<()>>,
    pub(crate) cancellation: TaskCancellationToken,
    grace_period_ms: AtomicU64,
    pub(crate) settled: Notify,
}

impl WorkflowEntry {
    fn new(record: WorkflowRecord, grace_period: Duration) -> Self {
        Self {
            id: record.id,
            record: RwLock::new(record),
            run_lock: Arc::new(Mutex::new(())),
            cancellation: TaskCancellationToken::new(),
            grace_period_ms: AtomicU64::new(duration_millis(grace_period)),
            settled: Notify::new(),
        }
    }

    pub(crate) fn read<T>(&self, read: impl FnOnce(&WorkflowRecord) -> T) -> OrchestrationResult<T> {
        let guard = self.record.read().map_err(|_| self.poisoned())?;
        Ok(read(&guard))
    }

    pub(crate) fn write<T>(
        &self,
        write: impl FnOnce(&mut WorkflowRecord) -> OrchestrationResult<T>,
    ) -> OrchestrationResult<T> {
        let mut guard = self.record.write().map_err(|_| self.poisoned())?;
        write(&mut guard)
    }

    /// Write access that ignores poisoning, for settling after a fault.
    pub(crate) fn force_write<T>(&self, write: impl FnOnce(&mut WorkflowRecord) -> T) -> T {
        let mut guard = self
            .record
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        write(&mut guard)
    }

    pub(crate) fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms.load(Ordering::SeqCst))
    }

    fn set_grace_period(&self, grace_period: Duration) {
        self.grace_period_ms
            .store(duration_millis(grace_period), Ordering::SeqCst);
    }

    fn poisoned(&self) -> CoreError {
        CoreError::new(CoreErrorKind::Internal, "workflow state lock poisoned").with_workflow(self.id)
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

enum CancelAction {
    Signal,
    Settled(WorkflowRecord),
    Nothing,
}

/// Owns every workflow and runs them against a shared adapter registry.
///
/// Construct once at startup and share by reference or `Arc`. Parallelism is
/// bounded orchestrator-wide by `max_parallel_tasks`.
pub struct Orchestrator {
    registry: AdapterRegistry,
    templates: TemplateLibrary,
    config: OrchestratorConfig,
    permits: Arc<Semaphore>,
    store: Option<Arc<dyn WorkflowStore>>,
    workflows: RwLock<HashMap<WorkflowId, Arc<WorkflowEntry>>>,
    next_workflow_id: AtomicU64,
}

impl Orchestrator {
    pub fn new(registry: AdapterRegistry) -> Self {
        Self::with_config(registry, OrchestratorConfig::default())
    }

    pub fn with_config(registry: AdapterRegistry, config: OrchestratorConfig) -> Self {
        Self {
            registry,
            templates: TemplateLibrary::builtin(),
            permits: Arc::new(Semaphore::new(config.max_parallel_tasks.max(1))),
            config,
            store: None,
            workflows: RwLock::new(HashMap::new()),
            next_workflow_id: AtomicU64::new(1),
        }
    }

    /// Loads persisted workflows, settling any that were left running.
    ///
    /// Tasks recorded as running become failed(Interrupted) and pending tasks
    /// become skipped; they are never re-run. Fixups are written back.
    pub async fn with_store(
        registry: AdapterRegistry,
        config: OrchestratorConfig,
        store: Arc<dyn WorkflowStore>,
    ) -> OrchestrationResult<Self> {
        let mut orchestrator = Self::with_config(registry, config);
        let (loaded, next_id) = load_stored(&store).await?;

        let mut entries = HashMap::with_capacity(loaded.len());
        for mut workflow in loaded {
            if workflow.status == WorkflowStatus::Running {
                let now = SystemTime::now();
                let touched = executor::settle_unfinished(
                    &mut workflow,
                    &TaskError {
                        kind: CoreErrorKind::Interrupted,
                        message: "process exited while the task was running".to_string(),
                    },
                    &SkipReason::Interrupted,
                    now,
                );
                workflow.status = WorkflowStatus::Failed;
                workflow.finished_at = Some(now);
                workflow.error_message = Some("interrupted by process restart".to_string());
                tracing::warn!(
                    workflow_id = %workflow.id,
                    tasks = touched.len(),
                    "recovered interrupted workflow as failed"
                );

                let fixed = workflow.clone();
                executor::store_call(&store, move |store| {
                    store.update_workflow(&fixed)?;
                    for task in fixed.tasks.iter().filter(|task| touched.contains(&task.id)) {
                        store.upsert_task(fixed.id, task)?;
                    }
                    Ok(())
                })
                .await?;
            }

            let grace = orchestrator.config.cancel_grace_period();
            entries.insert(workflow.id, Arc::new(WorkflowEntry::new(workflow, grace)));
        }

        tracing::info!(
            workflows = entries.len(),
            next_workflow_id = next_id,
            "loaded persisted workflows"
        );
        orchestrator.workflows = RwLock::new(entries);
        orchestrator.next_workflow_id = AtomicU64::new(next_id);
        orchestrator.store = Some(store);
        Ok(orchestrator)
    }

    /// Loads stored workflows for inspection without taking ownership of them.
    ///
    /// Running workflows are reported as stored, since another process may
    /// still be driving them. No store is attached, so nothing is written back.
    pub async fn open_read_only(
        registry: AdapterRegistry,
        config: OrchestratorConfig,
        store: Arc<dyn WorkflowStore>,
    ) -> OrchestrationResult<Self> {
        let mut orchestrator = Self::with_config(registry, config);
        let (loaded, next_id) = load_stored(&store).await?;

        let grace = orchestrator.config.cancel_grace_period();
        let entries = loaded
            .into_iter()
            .map(|workflow| (workflow.id, Arc::new(WorkflowEntry::new(workflow, grace))))
            .collect::<HashMap<_, _>>();

        tracing::debug!(workflows = entries.len(), "opened stored workflows read-only");
        orchestrator.workflows = RwLock::new(entries);
        orchestrator.next_workflow_id = AtomicU64::new(next_id);
        Ok(orchestrator)
    }

    pub fn with_templates(mut self, templates: TemplateLibrary) -> Self {
        self.templates = templates;
        self
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub async fn create_workflow(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        target: impl Into<String>,
    ) -> OrchestrationResult<WorkflowId> {
        let record = WorkflowRecord::new(self.allocate_id(), name, description, target);
        validate_header(&record)?;
        self.insert_new(record).await
    }

    pub async fn add_task(
        &self,
        workflow_id: WorkflowId,
        task: NewTask,
    ) -> OrchestrationResult<TaskId> {
        let entry = self.entry(workflow_id)?;
        let adapter = self.resolve_adapter(&task.adapter)?;
        adapter
            .validate_options(&task.options)
            .map_err(|error| error.attributed(workflow_id, task.id.as_ref(), Some(&task.adapter)))?;
        if let Some(empty) = task.depends_on.iter().find(|id| id.as_str().trim().is_empty()) {
            return Err(invalid_input(format!("dependency id '{empty}' is blank"))
                .with_workflow(workflow_id));
        }

        let record = entry.write(|workflow| {
            if workflow.status != WorkflowStatus::Created {
                return Err(invalid_state(workflow, "tasks can only be added before execution"));
            }

            let id = match task.id {
                Some(id) if id.as_str().trim().is_empty() => {
                    return Err(invalid_input("task id must not be empty"));
                }
                Some(id) if workflow.task(&id).is_some() => {
                    return Err(invalid_input(format!("task '{id}' already exists")));
                }
                Some(id) => id,
                None => generated_task_id(workflow),
            };

            let depends_on: BTreeSet<TaskId> = task.depends_on.into_iter().collect();
            let record = TaskRecord::pending(id, task.adapter, task.options, depends_on);

            let mut candidate = workflow.tasks.clone();
            candidate.push(record.clone());
            DependencyGraph::known(&candidate).ensure_acyclic()?;

            workflow.tasks.push(record.clone());
            Ok(record)
        })
        .map_err(|error| error.attributed(workflow_id, None, None))?;

        if let Some(store) = &self.store {
            let persisted = record.clone();
            if let Err(error) =
                executor::store_call(store, move |store| store.upsert_task(workflow_id, &persisted))
                    .await
            {
                entry.force_write(|workflow| workflow.tasks.retain(|task| task.id != record.id));
                return Err(error.attributed(workflow_id, Some(&record.id), None));
            }
        }

        tracing::debug!(
            workflow_id = %workflow_id,
            task_id = %record.id,
            adapter = %record.adapter,
            "task added"
        );
        Ok(record.id)
    }

    /// Validates the whole graph and starts the run. Returns once the workflow
    /// is `running` (or already `completed` when it has no tasks).
    pub async fn execute(&self, workflow_id: WorkflowId) -> OrchestrationResult<()> {
        let entry = self.entry(workflow_id)?;
        let execution_guard = entry.run_lock.clone().try_lock_owned().map_err(|_| {
            CoreError::new(CoreErrorKind::AlreadyRunning, "workflow is already running")
                .with_workflow(workflow_id)
        })?;

        let (graph, tasks, header) = entry
            .write(|workflow| {
                match workflow.status {
                    WorkflowStatus::Created => {}
                    WorkflowStatus::Running => {
                        return Err(CoreError::new(
                            CoreErrorKind::AlreadyRunning,
                            "workflow is already running",
                        ));
                    }
                    _ => return Err(invalid_state(workflow, "workflow has already run")),
                }

                let graph = DependencyGraph::validated(&workflow.tasks)?;
                let tasks = workflow
                    .tasks
                    .iter()
                    .map(|task| self.plan_task(task))
                    .collect::<OrchestrationResult<Vec<_>>>()?;

                let now = SystemTime::now();
                workflow.status = WorkflowStatus::Running;
                workflow.started_at = Some(now);
                if workflow.tasks.is_empty() {
                    workflow.status = WorkflowStatus::Completed;
                    workflow.finished_at = Some(now);
                }
                Ok((graph, tasks, workflow.clone()))
            })
            .map_err(|error| error.attributed(workflow_id, None, None))?;

        let target = header.target.clone();
        let empty = header.tasks.is_empty();
        if let Some(store) = &self.store
            && let Err(error) =
                executor::store_call(store, move |store| store.update_workflow(&header)).await
        {
            tracing::error!(
                workflow_id = %workflow_id,
                kind = error.kind.as_str(),
                message = %error.message,
                "failed to persist workflow start"
            );
        }

        if empty {
            tracing::info!(workflow_id = %workflow_id, "workflow has no tasks; completed");
            drop(execution_guard);
            entry.settled.notify_waiters();
            return Ok(());
        }

        tracing::info!(workflow_id = %workflow_id, tasks = tasks.len(), "workflow started");
        executor::spawn_run(
            RunPlan {
                entry,
                graph,
                tasks,
                target,
                permits: self.permits.clone(),
                store: self.store.clone(),
            },
            execution_guard,
        );
        Ok(())
    }

    /// Cancels with the configured grace period for in-flight adapters.
    pub async fn cancel(&self, workflow_id: WorkflowId) -> OrchestrationResult<()> {
        let mode = CancellationMode::Graceful {
            grace_period: self.config.cancel_grace_period(),
        };
        self.cancel_with(workflow_id, mode).await
    }

    pub async fn cancel_with(
        &self,
        workflow_id: WorkflowId,
        mode: CancellationMode,
    ) -> OrchestrationResult<()> {
        let entry = self.entry(workflow_id)?;
        entry.set_grace_period(mode.grace_period());

        let action = entry.write(|workflow| {
            Ok(match workflow.status {
                WorkflowStatus::Running => CancelAction::Signal,
                WorkflowStatus::Created => {
                    let now = SystemTime::now();
                    for task in &mut workflow.tasks {
                        task.mark_skipped(SkipReason::WorkflowCancelled, now);
                    }
                    workflow.status = WorkflowStatus::Cancelled;
                    workflow.finished_at = Some(now);
                    CancelAction::Settled(workflow.clone())
                }
                _ => CancelAction::Nothing,
            })
        })?;

        match action {
            CancelAction::Signal => {
                tracing::info!(
                    workflow_id = %workflow_id,
                    grace_period_ms = duration_millis(mode.grace_period()),
                    "cancelling running workflow"
                );
                entry.cancellation.cancel();
            }
            CancelAction::Settled(settled) => {
                tracing::info!(workflow_id = %workflow_id, "cancelled workflow before execution");
                if let Some(store) = &self.store {
                    executor::store_call(store, move |store| {
                        store.update_workflow(&settled)?;
                        for task in &settled.tasks {
                            store.upsert_task(settled.id, task)?;
                        }
                        Ok(())
                    })
                    .await
                    .map_err(|error| error.attributed(workflow_id, None, None))?;
                }
                entry.settled.notify_waiters();
            }
            CancelAction::Nothing => {}
        }
        Ok(())
    }

    pub fn status(&self, workflow_id: WorkflowId) -> OrchestrationResult<WorkflowStatusReport> {
        self.entry(workflow_id)?.read(WorkflowRecord::status_report)
    }

    pub fn snapshot(&self, workflow_id: WorkflowId) -> OrchestrationResult<WorkflowRecord> {
        self.entry(workflow_id)?.read(WorkflowRecord::clone)
    }

    pub fn findings(&self, workflow_id: WorkflowId) -> OrchestrationResult<Vec<ExportedFinding>> {
        self.entry(workflow_id)?.read(aggregation::export_findings)
    }

    pub fn list_workflows(&self) -> OrchestrationResult<Vec<WorkflowSummary>> {
        let entries: Vec<Arc<WorkflowEntry>> = self
            .workflows
            .read()
            .map_err(|_| registry_poisoned())?
            .values()
            .cloned()
            .collect();
        let mut summaries = entries
            .iter()
            .map(|entry| entry.read(WorkflowRecord::summary))
            .collect::<OrchestrationResult<Vec<_>>>()?;
        summaries.sort_by_key(|summary| summary.id);
        Ok(summaries)
    }

    pub async fn add_tags(
        &self,
        workflow_id: WorkflowId,
        tags: impl IntoIterator<Item = impl Into<String>>,
    ) -> OrchestrationResult<()> {
        let tags: Vec<String> = tags
            .into_iter()
            .map(Into::into)
            .map(|tag: String| tag.trim().to_string())
            .filter(|tag| !tag.is_empty())
            .collect();
        let entry = self.entry(workflow_id)?;
        let header = entry
            .write(|workflow| {
                if workflow.status != WorkflowStatus::Created {
                    return Err(invalid_state(workflow, "tags can only be added before execution"));
                }
                workflow.tags.extend(tags);
                Ok(workflow.clone())
            })
            .map_err(|error| error.attributed(workflow_id, None, None))?;

        if let Some(store) = &self.store {
            executor::store_call(store, move |store| store.update_workflow(&header))
                .await
                .map_err(|error| error.attributed(workflow_id, None, None))?;
        }
        Ok(())
    }

    pub fn list_templates(&self) -> Vec<TemplateSummary> {
        self.templates.summaries()
    }

    pub fn templates(&self) -> &TemplateLibrary {
        &self.templates
    }

    /// Creates a workflow and its whole task graph from a template, or nothing
    /// at all if any part fails validation or persistence.
    pub async fn instantiate_template(
        &self,
        name: &str,
        target: &str,
        overrides: &TemplateOverrides,
    ) -> OrchestrationResult<WorkflowId> {
        let template = self.templates.get(name)?;
        let planned = template.plan(target, overrides)?;

        let mut tasks = Vec::with_capacity(planned.len());
        for task in planned {
            let adapter = self.resolve_adapter(&task.adapter)?;
            adapter.validate_options(&task.options)?;
            let id = task
                .id
                .ok_or_else(|| CoreError::new(CoreErrorKind::Internal, "template task has no key"))?;
            tasks.push(TaskRecord::pending(
                id,
                task.adapter,
                task.options,
                task.depends_on.into_iter().collect(),
            ));
        }
        DependencyGraph::validated(&tasks)?;

        let mut record = WorkflowRecord::new(
            self.allocate_id(),
            template.name.clone(),
            template.description.clone(),
            target.trim(),
        );
        record.tags = template.workflow_tags();
        record.tasks = tasks;
        validate_header(&record)?;

        let workflow_id = self.insert_new(record).await?;
        tracing::info!(
            workflow_id = %workflow_id,
            template = name,
            target = target.trim(),
            "instantiated workflow template"
        );
        Ok(workflow_id)
    }

    /// Waits until the workflow reaches a terminal status.
    pub async fn wait_for_terminal(
        &self,
        workflow_id: WorkflowId,
        timeout_duration: Option<Duration>,
    ) -> OrchestrationResult<WorkflowRecord> {
        let entry = self.entry(workflow_id)?;
        let wait = wait_until_terminal(&entry);

        match timeout_duration {
            Some(duration) => tokio::time::timeout(duration, wait).await.map_err(|_| {
                CoreError::new(
                    CoreErrorKind::Timeout,
                    format!("timed out waiting for workflow {workflow_id} to finish"),
                )
                .with_workflow(workflow_id)
            })?,
            None => wait.await,
        }
    }

    fn allocate_id(&self) -> WorkflowId {
        WorkflowId(self.next_workflow_id.fetch_add(1, Ordering::SeqCst))
    }

    fn entry(&self, workflow_id: WorkflowId) -> OrchestrationResult<Arc<WorkflowEntry>> {
        self.workflows
            .read()
            .map_err(|_| registry_poisoned())?
            .get(&workflow_id)
            .cloned()
            .ok_or_else(|| {
                CoreError::new(
                    CoreErrorKind::NotFound,
                    format!("no workflow with id {workflow_id}"),
                )
                .with_workflow(workflow_id)
            })
    }

    async fn insert_new(&self, record: WorkflowRecord) -> OrchestrationResult<WorkflowId> {
        let workflow_id = record.id;
        if let Some(store) = &self.store {
            let persisted = record.clone();
            executor::store_call(store, move |store| store.create_workflow(&persisted))
                .await
                .map_err(|error| error.attributed(workflow_id, None, None))?;
        }

        let entry = Arc::new(WorkflowEntry::new(record, self.config.cancel_grace_period()));
        self.workflows
            .write()
            .map_err(|_| registry_poisoned())?
            .insert(workflow_id, entry);
        tracing::debug!(workflow_id = %workflow_id, "workflow created");
        Ok(workflow_id)
    }

    fn resolve_adapter(&self, name: &str) -> OrchestrationResult<Arc<dyn ToolAdapter>> {
        self.registry.lookup(name).map_err(|_| {
            CoreError::new(
                CoreErrorKind::UnknownAdapter,
                format!("unknown adapter '{name}'"),
            )
            .with_adapter(name)
        })
    }

    fn plan_task(&self, task: &TaskRecord) -> OrchestrationResult<PlannedTask> {
        let adapter = self
            .resolve_adapter(&task.adapter)
            .map_err(|error| error.with_task(task.id.clone()))?;
        let timeout = adapter
            .descriptor()
            .default_timeout
            .unwrap_or_else(|| self.config.task_timeout());
        Ok(PlannedTask {
            id: task.id.clone(),
            adapter,
            options: task.options.clone(),
            timeout,
        })
    }
}

async fn wait_until_terminal(entry: &WorkflowEntry) -> OrchestrationResult<WorkflowRecord> {
    loop {
        let notified = entry.settled.notified();
        tokio::pin!(notified);
        // Register before reading so a terminal notification cannot slip by.
        notified.as_mut().enable();

        let terminal = entry.read(|workflow| {
            workflow
                .status
                .is_terminal()
                .then(|| workflow.clone())
        })?;
        if let Some(workflow) = terminal {
            return Ok(workflow);
        }
        notified.await;
    }
}

fn validate_header(record: &WorkflowRecord) -> OrchestrationResult<()> {
    if record.name.trim().is_empty() {
        return Err(invalid_input("workflow name must not be empty"));
    }
    if record.target.trim().is_empty() {
        return Err(invalid_input("workflow target must not be empty"));
    }
    Ok(())
}

fn generated_task_id(workflow: &WorkflowRecord) -> TaskId {
    let mut sequence = workflow.tasks.len() + 1;
    loop {
        let candidate = TaskId::new(format!("task-{sequence}"));
        if workflow.task(&candidate).is_none() {
            return candidate;
        }
        sequence += 1;
    }
}

fn invalid_input(message: impl Into<String>) -> CoreError {
    CoreError::new(CoreErrorKind::InvalidInput, message)
}

fn invalid_state(workflow: &WorkflowRecord, message: &str) -> CoreError {
    CoreError::new(
        CoreErrorKind::InvalidState,
        format!("{message} (workflow is {})", workflow.status.as_str()),
    )
}

fn registry_poisoned() -> CoreError {
    CoreError::new(CoreErrorKind::Internal, "workflow table lock poisoned")
}

async fn load_stored(
    store: &Arc<dyn WorkflowStore>,
) -> OrchestrationResult<(Vec<WorkflowRecord>, u64)> {
    let loader = store.clone();
    let (mut loaded, next_id) = tokio::task::spawn_blocking(move || {
        Ok::<_, CoreError>((loader.load_workflows()?, loader.next_workflow_id()?))
    })
    .await
    .map_err(|join_error| {
        CoreError::new(
            CoreErrorKind::Internal,
            format!("workflow load join failure: {join_error}"),
        )
    })??;

    let mut next_id = next_id.0.max(1);
    for workflow in &mut loaded {
        next_id = next_id.max(workflow.id.0 + 1);
        workflow.findings_summary = aggregation::recompute_summary(workflow);
    }
    Ok((loaded, next_id))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use crate::models::{AdapterOptions, TaskId, TaskRecord, WorkflowId, WorkflowRecord};

    use super::generated_task_id;

    #[test]
    fn generated_ids_skip_caller_chosen_names() {
        let mut workflow = WorkflowRecord::new(WorkflowId(1), "w", "", "example.com");
        assert_eq!(generated_task_id(&workflow), TaskId::from("task-1"));

        for id in ["task-2", "custom"] {
            workflow.tasks.push(TaskRecord::pending(
                TaskId::from(id),
                "stub",
                AdapterOptions::new(),
                BTreeSet::new(),
            ));
        }
        assert_eq!(generated_task_id(&workflow), TaskId::from("task-3"));
    }
}
