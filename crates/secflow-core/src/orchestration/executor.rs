use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::{OwnedMutexGuard, Semaphore, mpsc};
use tokio::task::JoinError;

use crate::adapters::{AdapterRequest, AdapterResult, ToolAdapter};
use crate::aggregation;
use crate::models::{
    AdapterOptions, CoreError, CoreErrorKind, SkipReason, TaskError, TaskId, TaskRecord,
    TaskStatus, ToolResult, ToolStatus, WorkflowId, WorkflowRecord, WorkflowStatus,
};
use crate::orchestration::orchestrator::WorkflowEntry;
use crate::orchestration::{DependencyGraph, OrchestrationResult, TaskCancellationToken};
use crate::persistence::{PersistenceResult, WorkflowStore};

/// A task resolved against the registry, ready to dispatch.
pub(crate) struct PlannedTask {
    pub(crate) id: TaskId,
    pub(crate) adapter: Arc<dyn ToolAdapter>,
    pub(crate) options: AdapterOptions,
    pub(crate) timeout: Duration,
}

impl PlannedTask {
    fn adapter_name(&self) -> &'static str {
        self.adapter.descriptor().name
    }
}

/// Everything one workflow run needs, validated before the run starts.
pub(crate) struct RunPlan {
    pub(crate) entry: Arc<WorkflowEntry>,
    pub(crate) graph: DependencyGraph,
    pub(crate) tasks: Vec<PlannedTask>,
    pub(crate) target: String,
    pub(crate) permits: Arc<Semaphore>,
    pub(crate) store: Option<Arc<dyn WorkflowStore>>,
}

enum TaskEvent {
    Started {
        task: TaskId,
        at: SystemTime,
    },
    Finished {
        task: TaskId,
        outcome: TaskOutcome,
        elapsed: Duration,
    },
    /// Cancelled while still waiting for a permit; the adapter never ran.
    Abandoned {
        task: TaskId,
    },
}

enum TaskOutcome {
    Completed(ToolResult),
    Failed { result: ToolResult, error: TaskError },
}

impl TaskOutcome {
    fn failed(adapter: &str, error: CoreError) -> Self {
        Self::Failed {
            result: ToolResult::from_error(adapter, &error),
            error: TaskError {
                kind: error.kind,
                message: error.message,
            },
        }
    }
}

/// Starts the supervisor for a workflow whose status is already `running`.
///
/// A watcher owns the execution lock. It settles the workflow if the
/// supervisor errors or panics, then releases the lock and wakes waiters.
pub(crate) fn spawn_run(plan: RunPlan, execution_guard: OwnedMutexGuard<()>) {
    let entry = plan.entry.clone();
    let store = plan.store.clone();
    let supervisor = tokio::spawn(supervise(plan));

    tokio::spawn(async move {
        let fault = match supervisor.await {
            Ok(Ok(())) => None,
            Ok(Err(error)) => Some(error.message),
            Err(join_error) => Some(format!("workflow supervisor panicked: {join_error}")),
        };
        if let Some(message) = fault {
            tracing::error!(
                workflow_id = %entry.id,
                message = %message,
                "workflow supervisor failed; settling workflow as failed"
            );
            settle_after_fault(&entry, store.as_ref(), message).await;
        }

        drop(execution_guard);
        entry.settled.notify_waiters();
    });
}

async fn supervise(plan: RunPlan) -> OrchestrationResult<()> {
    let RunPlan {
        entry,
        graph,
        tasks,
        target,
        permits,
        store,
    } = plan;
    let workflow_id = entry.id;
    let target: Arc<str> = Arc::from(target);

    let mut statuses: HashMap<TaskId, TaskStatus> = graph
        .ids()
        .iter()
        .map(|id| (id.clone(), TaskStatus::Pending))
        .collect();
    let mut undispatched: HashMap<TaskId, PlannedTask> = tasks
        .into_iter()
        .map(|task| (task.id.clone(), task))
        .collect();
    let mut in_flight = 0usize;
    let mut cancel_observed = false;
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<TaskEvent>();

    loop {
        if !cancel_observed && entry.cancellation.is_cancelled() {
            cancel_observed = true;
            tracing::info!(workflow_id = %workflow_id, in_flight, "workflow cancellation observed");
            let unstarted: Vec<TaskId> = graph
                .ids()
                .iter()
                .filter(|id| undispatched.contains_key(*id))
                .filter(|id| statuses.get(*id) == Some(&TaskStatus::Pending))
                .cloned()
                .collect();
            for id in unstarted {
                undispatched.remove(&id);
                skip_task(
                    &entry,
                    store.as_ref(),
                    &mut statuses,
                    &id,
                    SkipReason::WorkflowCancelled,
                )
                .await?;
            }
        }

        if !cancel_observed {
            for id in ready_tasks(&graph, &statuses, &undispatched) {
                let Some(task) = undispatched.remove(&id) else {
                    continue;
                };
                tracing::debug!(
                    workflow_id = %workflow_id,
                    task_id = %task.id,
                    adapter = task.adapter_name(),
                    "dispatching task"
                );
                in_flight += 1;
                tokio::spawn(run_unit(
                    task,
                    UnitContext {
                        workflow: workflow_id,
                        target: target.clone(),
                        entry: entry.clone(),
                        permits: permits.clone(),
                    },
                    events_tx.clone(),
                ));
            }
        }

        if in_flight == 0 {
            break;
        }

        tokio::select! {
            event = events_rx.recv() => {
                let Some(event) = event else {
                    return Err(internal(workflow_id, "task event channel closed"));
                };
                match event {
                    TaskEvent::Started { task, at } => {
                        statuses.insert(task.clone(), TaskStatus::Running);
                        let record = update_task(&entry, &task, |record| record.mark_running(at))?;
                        persist_task_logged(store.as_ref(), workflow_id, record).await;
                    }
                    TaskEvent::Finished { task, outcome, elapsed } => {
                        in_flight -= 1;
                        let failed = matches!(outcome, TaskOutcome::Failed { .. });
                        finish_task(&entry, store.as_ref(), &mut statuses, &task, outcome, elapsed)
                            .await?;
                        if failed {
                            for dependent in graph.descendants(&task) {
                                if statuses.get(&dependent) == Some(&TaskStatus::Pending) {
                                    undispatched.remove(&dependent);
                                    skip_task(
                                        &entry,
                                        store.as_ref(),
                                        &mut statuses,
                                        &dependent,
                                        SkipReason::DependencyFailed { dependency: task.clone() },
                                    )
                                    .await?;
                                }
                            }
                        }
                    }
                    TaskEvent::Abandoned { task } => {
                        in_flight -= 1;
                        skip_task(
                            &entry,
                            store.as_ref(),
                            &mut statuses,
                            &task,
                            SkipReason::WorkflowCancelled,
                        )
                        .await?;
                    }
                }
            }
            _ = entry.cancellation.cancelled(), if !cancel_observed => {}
        }
    }

    let stranded = statuses
        .values()
        .filter(|status| !status.is_terminal())
        .count();
    if stranded > 0 {
        return Err(internal(
            workflow_id,
            format!("{stranded} tasks were never scheduled"),
        ));
    }

    let any_failed = statuses.values().any(|status| *status == TaskStatus::Failed);
    let terminal = if entry.cancellation.is_cancelled() {
        WorkflowStatus::Cancelled
    } else if any_failed {
        WorkflowStatus::Failed
    } else {
        WorkflowStatus::Completed
    };

    // Stored before the in-memory status flips; waiters rely on that order.
    let finished_at = SystemTime::now();
    let mut header = entry.read(|workflow| workflow.clone())?;
    header.status = terminal;
    header.finished_at = Some(finished_at);
    let findings = header.findings_summary.total();
    if let Some(store) = store.as_ref() {
        log_persistence_failure(
            workflow_id,
            None,
            store_call(store, move |store| store.update_workflow(&header)).await,
        );
    }
    entry.write(|workflow| {
        workflow.status = terminal;
        workflow.finished_at = Some(finished_at);
        Ok(())
    })?;
    tracing::info!(
        workflow_id = %workflow_id,
        status = terminal.as_str(),
        findings,
        "workflow finished"
    );
    Ok(())
}

fn ready_tasks(
    graph: &DependencyGraph,
    statuses: &HashMap<TaskId, TaskStatus>,
    undispatched: &HashMap<TaskId, PlannedTask>,
) -> Vec<TaskId> {
    graph
        .ids()
        .iter()
        .filter(|id| undispatched.contains_key(*id))
        .filter(|id| statuses.get(*id) == Some(&TaskStatus::Pending))
        .filter(|id| {
            graph
                .dependencies(id)
                .into_iter()
                .all(|dependency| statuses.get(dependency) == Some(&TaskStatus::Completed))
        })
        .cloned()
        .collect()
}

struct UnitContext {
    workflow: WorkflowId,
    target: Arc<str>,
    entry: Arc<WorkflowEntry>,
    permits: Arc<Semaphore>,
}

/// One dispatched task: wait for a permit, run the adapter on the blocking
/// pool, report back.
async fn run_unit(task: PlannedTask, context: UnitContext, events: mpsc::UnboundedSender<TaskEvent>) {
    let cancellation = context.entry.cancellation.clone();
    let permit = tokio::select! {
        biased;
        _ = cancellation.cancelled() => {
            let _ = events.send(TaskEvent::Abandoned { task: task.id });
            return;
        }
        permit = context.permits.clone().acquire_owned() => permit,
    };

    let started = Instant::now();
    let outcome = match permit {
        Ok(_permit) => {
            let _ = events.send(TaskEvent::Started {
                task: task.id.clone(),
                at: SystemTime::now(),
            });
            invoke_adapter(&task, &context, &cancellation).await
        }
        Err(_) => TaskOutcome::failed(
            task.adapter_name(),
            CoreError::new(CoreErrorKind::Internal, "task permit pool closed"),
        ),
    };

    if let TaskOutcome::Failed { error, .. } = &outcome {
        tracing::warn!(
            workflow_id = %context.workflow,
            task_id = %task.id,
            adapter = task.adapter_name(),
            kind = error.kind.as_str(),
            message = %error.message,
            "task failed"
        );
    }

    let _ = events.send(TaskEvent::Finished {
        task: task.id,
        outcome,
        elapsed: started.elapsed(),
    });
}

enum Interrupt {
    Deadline,
    Cancelled,
}

async fn invoke_adapter(
    task: &PlannedTask,
    context: &UnitContext,
    cancellation: &TaskCancellationToken,
) -> TaskOutcome {
    // Per-call token so a timeout interrupts only this adapter.
    let call_token = TaskCancellationToken::new();
    let request = AdapterRequest::new(context.workflow, task.id.clone(), context.target.as_ref())
        .options(task.options.clone())
        .timeout(task.timeout)
        .cancellation(call_token.clone());
    let adapter = task.adapter.clone();
    let deadline = tokio::time::Instant::now() + task.timeout;
    let mut call = tokio::task::spawn_blocking(move || adapter.execute(request));

    let interrupt = tokio::select! {
        joined = &mut call => return outcome_from_join(task.adapter_name(), joined),
        _ = tokio::time::sleep_until(deadline) => Interrupt::Deadline,
        _ = cancellation.cancelled() => Interrupt::Cancelled,
    };
    call_token.cancel();

    match interrupt {
        Interrupt::Deadline => timed_out(task),
        Interrupt::Cancelled => {
            // The grace period never outlives the adapter timeout.
            let grace = context.entry.grace_period();
            let grace_end = tokio::time::Instant::now() + grace;
            let stop = grace_end.min(deadline);
            tokio::select! {
                joined = &mut call => outcome_from_join(task.adapter_name(), joined),
                _ = tokio::time::sleep_until(stop) => {
                    if stop == deadline {
                        timed_out(task)
                    } else {
                        TaskOutcome::failed(
                            task.adapter_name(),
                            CoreError::new(
                                CoreErrorKind::Cancelled,
                                format!(
                                    "workflow cancelled; adapter abandoned after {}ms grace period",
                                    grace.as_millis()
                                ),
                            ),
                        )
                    }
                }
            }
        }
    }
}

fn timed_out(task: &PlannedTask) -> TaskOutcome {
    TaskOutcome::failed(
        task.adapter_name(),
        CoreError::new(
            CoreErrorKind::Timeout,
            format!(
                "{} exceeded its {}ms timeout",
                task.adapter_name(),
                task.timeout.as_millis()
            ),
        ),
    )
}

fn outcome_from_join(
    adapter: &str,
    joined: Result<AdapterResult<ToolResult>, JoinError>,
) -> TaskOutcome {
    match joined {
        Ok(Ok(result)) if result.is_success() => TaskOutcome::Completed(result),
        Ok(Ok(result)) => {
            let kind = if result.status == ToolStatus::Timeout {
                CoreErrorKind::Timeout
            } else {
                CoreErrorKind::ProcessFailure
            };
            let message = result
                .error
                .clone()
                .unwrap_or_else(|| format!("{adapter} reported failure"));
            TaskOutcome::Failed {
                result,
                error: TaskError { kind, message },
            }
        }
        Ok(Err(error)) => TaskOutcome::failed(adapter, error),
        Err(join_error) => TaskOutcome::failed(
            adapter,
            CoreError::new(
                CoreErrorKind::Internal,
                format!("adapter execution join failure: {join_error}"),
            ),
        ),
    }
}

fn update_task(
    entry: &WorkflowEntry,
    id: &TaskId,
    apply: impl FnOnce(&mut TaskRecord),
) -> OrchestrationResult<TaskRecord> {
    let workflow_id = entry.id;
    entry.write(|workflow| {
        let WorkflowRecord {
            tasks,
            findings_summary,
            ..
        } = workflow;
        let task = tasks
            .iter_mut()
            .find(|task| &task.id == id)
            .ok_or_else(|| internal(workflow_id, format!("task '{id}' vanished from workflow")))?;
        let was_completed = task.status == TaskStatus::Completed;
        apply(task);
        if !was_completed {
            aggregation::apply_task(findings_summary, task);
        }
        Ok(task.clone())
    })
}

async fn finish_task(
    entry: &WorkflowEntry,
    store: Option<&Arc<dyn WorkflowStore>>,
    statuses: &mut HashMap<TaskId, TaskStatus>,
    id: &TaskId,
    outcome: TaskOutcome,
    elapsed: Duration,
) -> OrchestrationResult<()> {
    let now = SystemTime::now();
    let record = match outcome {
        TaskOutcome::Completed(mut result) => {
            result.execution_time = elapsed;
            statuses.insert(id.clone(), TaskStatus::Completed);
            update_task(entry, id, |task| task.mark_completed(result, now))?
        }
        TaskOutcome::Failed { mut result, error } => {
            result.execution_time = elapsed;
            statuses.insert(id.clone(), TaskStatus::Failed);
            update_task(entry, id, |task| task.mark_failed(Some(result), error, now))?
        }
    };
    persist_task_logged(store, entry.id, record).await;
    Ok(())
}

async fn skip_task(
    entry: &WorkflowEntry,
    store: Option<&Arc<dyn WorkflowStore>>,
    statuses: &mut HashMap<TaskId, TaskStatus>,
    id: &TaskId,
    reason: SkipReason,
) -> OrchestrationResult<()> {
    tracing::debug!(workflow_id = %entry.id, task_id = %id, reason = ?reason, "skipping task");
    statuses.insert(id.clone(), TaskStatus::Skipped);
    let now = SystemTime::now();
    let record = update_task(entry, id, |task| task.mark_skipped(reason, now))?;
    persist_task_logged(store, entry.id, record).await;
    Ok(())
}

/// Settles every unfinished task in place and returns the ids it touched.
pub(crate) fn settle_unfinished(
    workflow: &mut WorkflowRecord,
    running_error: &TaskError,
    pending_reason: &SkipReason,
    at: SystemTime,
) -> Vec<TaskId> {
    let mut touched = Vec::new();
    for task in &mut workflow.tasks {
        match task.status {
            TaskStatus::Running => task.mark_failed(task.result.clone(), running_error.clone(), at),
            TaskStatus::Pending => task.mark_skipped(pending_reason.clone(), at),
            _ => continue,
        }
        touched.push(task.id.clone());
    }
    touched
}

async fn settle_after_fault(
    entry: &WorkflowEntry,
    store: Option<&Arc<dyn WorkflowStore>>,
    message: String,
) {
    let settled = entry.force_write(|workflow| {
        let now = SystemTime::now();
        let error = TaskError {
            kind: CoreErrorKind::Internal,
            message: message.clone(),
        };
        settle_unfinished(workflow, &error, &SkipReason::Interrupted, now);
        workflow.status = WorkflowStatus::Failed;
        workflow.finished_at = Some(now);
        workflow.error_message = Some(message);
        workflow.clone()
    });

    if let Some(store) = store {
        let workflow_id = settled.id;
        let result = store_call(store, move |store| {
            store.update_workflow(&settled)?;
            for task in &settled.tasks {
                store.upsert_task(settled.id, task)?;
            }
            Ok(())
        })
        .await;
        log_persistence_failure(workflow_id, None, result);
    }
}

/// Runs a store operation on the blocking pool.
pub(crate) async fn store_call(
    store: &Arc<dyn WorkflowStore>,
    operation: impl FnOnce(&dyn WorkflowStore) -> PersistenceResult<()> + Send + 'static,
) -> OrchestrationResult<()> {
    let store = store.clone();
    tokio::task::spawn_blocking(move || operation(store.as_ref()))
        .await
        .map_err(|join_error| {
            CoreError::new(
                CoreErrorKind::Internal,
                format!("workflow persistence join failure: {join_error}"),
            )
        })?
}

async fn persist_task_logged(
    store: Option<&Arc<dyn WorkflowStore>>,
    workflow: WorkflowId,
    task: TaskRecord,
) {
    let Some(store) = store else {
        return;
    };
    let task_id = task.id.clone();
    let result = store_call(store, move |store| store.upsert_task(workflow, &task)).await;
    log_persistence_failure(workflow, Some(&task_id), result);
}

fn log_persistence_failure(
    workflow: WorkflowId,
    task: Option<&TaskId>,
    result: OrchestrationResult<()>,
) {
    if let Err(error) = result {
        let error = error.attributed(workflow, task, None);
        tracing::error!(
            workflow_id = %workflow,
            task_id = ?error.task.as_ref().map(TaskId::as_str),
            kind = error.kind.as_str(),
            message = %error.message,
            "failed to persist workflow state"
        );
    }
}

fn internal(workflow: WorkflowId, message: impl Into<String>) -> CoreError {
    CoreError::new(CoreErrorKind::Internal, message).with_workflow(workflow)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::time::SystemTime;

    use crate::models::{
        AdapterOptions, CoreErrorKind, SkipReason, TaskError, TaskId, TaskRecord, TaskStatus,
        WorkflowId, WorkflowRecord,
    };

    use super::settle_unfinished;

    #[test]
    fn settle_unfinished_fails_running_and_skips_pending() {
        let mut workflow = WorkflowRecord::new(WorkflowId(1), "w", "", "example.com");
        for (id, status) in [
            ("done", TaskStatus::Completed),
            ("busy", TaskStatus::Running),
            ("queued", TaskStatus::Pending),
        ] {
            let mut task =
                TaskRecord::pending(TaskId::from(id), "stub", AdapterOptions::new(), BTreeSet::new());
            task.status = status;
            workflow.tasks.push(task);
        }

        let touched = settle_unfinished(
            &mut workflow,
            &TaskError {
                kind: CoreErrorKind::Interrupted,
                message: "process restarted".to_string(),
            },
            &SkipReason::Interrupted,
            SystemTime::now(),
        );

        assert_eq!(touched, vec![TaskId::from("busy"), TaskId::from("queued")]);
        assert!(workflow.tasks.iter().all(|task| task.status.is_terminal()));
        let busy = workflow.task(&TaskId::from("busy")).unwrap();
        assert_eq!(busy.status, TaskStatus::Failed);
        assert_eq!(busy.error.as_ref().unwrap().kind, CoreErrorKind::Interrupted);
        let queued = workflow.task(&TaskId::from("queued")).unwrap();
        assert_eq!(queued.skip_reason, Some(SkipReason::Interrupted));
        assert_eq!(workflow.task(&TaskId::from("done")).unwrap().status, TaskStatus::Completed);
    }
}
