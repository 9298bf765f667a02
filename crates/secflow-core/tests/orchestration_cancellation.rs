mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{Behavior, ScriptedAdapter, registry_with};
use secflow_core::config::OrchestratorConfig;
use secflow_core::models::{
    CoreErrorKind, NewTask, SkipReason, TaskId, TaskStatus, WorkflowId, WorkflowStatus,
};
use secflow_core::orchestration::{CancellationMode, Orchestrator};

const WAIT: Option<Duration> = Some(Duration::from_secs(10));

fn orchestrator(probe: Arc<ScriptedAdapter>, max_parallel_tasks: usize) -> Orchestrator {
    Orchestrator::with_config(
        registry_with(vec![probe]),
        OrchestratorConfig {
            max_parallel_tasks,
            cancel_grace_period_ms: 1000,
            ..OrchestratorConfig::default()
        },
    )
}

async fn wait_until_running(orchestrator: &Orchestrator, workflow: WorkflowId) {
    for _ in 0..400 {
        if orchestrator.status(workflow).unwrap().running_count > 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("no task of workflow {workflow} reached running");
}

async fn a_then_b(orchestrator: &Orchestrator) -> WorkflowId {
    let workflow = orchestrator
        .create_workflow("cancel", "", "example.com")
        .await
        .unwrap();
    orchestrator
        .add_task(workflow, NewTask::new("probe").id("A"))
        .await
        .unwrap();
    orchestrator
        .add_task(workflow, NewTask::new("probe").id("B").depends_on("A"))
        .await
        .unwrap();
    workflow
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelling_mid_run_never_completes_the_dependent() {
    let probe = Arc::new(ScriptedAdapter::named("probe").script("A", Behavior::UntilCancelled));
    let orchestrator = orchestrator(probe.clone(), 4);
    let workflow = a_then_b(&orchestrator).await;

    orchestrator.execute(workflow).await.unwrap();
    wait_until_running(&orchestrator, workflow).await;
    orchestrator.cancel(workflow).await.unwrap();

    let record = orchestrator.wait_for_terminal(workflow, WAIT).await.unwrap();
    assert_eq!(record.status, WorkflowStatus::Cancelled);

    let a = record.task(&TaskId::new("A")).unwrap();
    assert_eq!(a.status, TaskStatus::Failed);
    assert_eq!(
        a.error.as_ref().map(|error| error.kind),
        Some(CoreErrorKind::Cancelled)
    );

    let b = record.task(&TaskId::new("B")).unwrap();
    assert_eq!(b.status, TaskStatus::Skipped);
    assert!(!probe.invoked("B"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn immediate_cancel_abandons_an_unresponsive_adapter() {
    let probe = Arc::new(
        ScriptedAdapter::named("probe").script("A", Behavior::Sleep(Duration::from_secs(2))),
    );
    let orchestrator = orchestrator(probe, 4);
    let workflow = a_then_b(&orchestrator).await;

    orchestrator.execute(workflow).await.unwrap();
    wait_until_running(&orchestrator, workflow).await;
    orchestrator
        .cancel_with(workflow, CancellationMode::Immediate)
        .await
        .unwrap();

    let record = orchestrator
        .wait_for_terminal(workflow, Some(Duration::from_secs(1)))
        .await
        .unwrap();
    assert_eq!(record.status, WorkflowStatus::Cancelled);
    let a = record.task(&TaskId::new("A")).unwrap();
    assert_eq!(
        a.error.as_ref().map(|error| error.kind),
        Some(CoreErrorKind::Cancelled)
    );
    assert_eq!(
        record.task(&TaskId::new("B")).unwrap().status,
        TaskStatus::Skipped
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn grace_period_is_bounded_by_the_adapter_timeout() {
    let probe = Arc::new(
        ScriptedAdapter::named("probe")
            .with_timeout(Duration::from_millis(200))
            .script("A", Behavior::Sleep(Duration::from_millis(1500))),
    );
    let orchestrator = orchestrator(probe, 4);
    let workflow = a_then_b(&orchestrator).await;

    let started = Instant::now();
    orchestrator.execute(workflow).await.unwrap();
    wait_until_running(&orchestrator, workflow).await;
    orchestrator
        .cancel_with(
            workflow,
            CancellationMode::Graceful {
                grace_period: Duration::from_secs(5),
            },
        )
        .await
        .unwrap();

    let record = orchestrator.wait_for_terminal(workflow, WAIT).await.unwrap();
    assert!(
        started.elapsed() < Duration::from_millis(1200),
        "workflow settled after {:?}",
        started.elapsed()
    );
    assert_eq!(record.status, WorkflowStatus::Cancelled);

    let a = record.task(&TaskId::new("A")).unwrap();
    assert_eq!(a.status, TaskStatus::Failed);
    assert_eq!(
        a.error.as_ref().map(|error| error.kind),
        Some(CoreErrorKind::Timeout)
    );
    assert_eq!(
        record.task(&TaskId::new("B")).unwrap().status,
        TaskStatus::Skipped
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tasks_waiting_for_a_permit_are_skipped_on_cancel() {
    let probe = Arc::new(
        ScriptedAdapter::named("probe")
            .script("busy", Behavior::UntilCancelled)
            .script("queued", Behavior::UntilCancelled),
    );
    let orchestrator = orchestrator(probe.clone(), 1);
    let workflow = orchestrator
        .create_workflow("queued", "", "example.com")
        .await
        .unwrap();
    orchestrator
        .add_task(workflow, NewTask::new("probe").id("busy"))
        .await
        .unwrap();
    orchestrator
        .add_task(workflow, NewTask::new("probe").id("queued"))
        .await
        .unwrap();

    orchestrator.execute(workflow).await.unwrap();
    wait_until_running(&orchestrator, workflow).await;
    orchestrator.cancel(workflow).await.unwrap();

    let record = orchestrator.wait_for_terminal(workflow, WAIT).await.unwrap();
    assert_eq!(record.status, WorkflowStatus::Cancelled);

    // Either task may win the single permit.
    let running_first = record
        .tasks
        .iter()
        .find(|task| task.status == TaskStatus::Failed)
        .unwrap();
    let waited = record
        .tasks
        .iter()
        .find(|task| task.id != running_first.id)
        .unwrap();
    assert_eq!(waited.status, TaskStatus::Skipped);
    assert_eq!(waited.skip_reason, Some(SkipReason::WorkflowCancelled));
    assert_eq!(probe.invocation_count(), 1);
}

#[tokio::test]
async fn cancelling_before_execute_settles_every_task() {
    let probe = Arc::new(ScriptedAdapter::named("probe"));
    let orchestrator = orchestrator(probe.clone(), 4);
    let workflow = a_then_b(&orchestrator).await;

    orchestrator.cancel(workflow).await.unwrap();
    let record = orchestrator.wait_for_terminal(workflow, WAIT).await.unwrap();

    assert_eq!(record.status, WorkflowStatus::Cancelled);
    assert!(record.tasks.iter().all(|task| {
        task.status == TaskStatus::Skipped
            && task.skip_reason == Some(SkipReason::WorkflowCancelled)
    }));

    let error = orchestrator.execute(workflow).await.unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::InvalidState);
    assert_eq!(probe.invocation_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelling_a_finished_workflow_changes_nothing() {
    let probe = Arc::new(ScriptedAdapter::named("probe"));
    let orchestrator = orchestrator(probe, 4);
    let workflow = a_then_b(&orchestrator).await;

    orchestrator.execute(workflow).await.unwrap();
    let finished = orchestrator.wait_for_terminal(workflow, WAIT).await.unwrap();
    assert_eq!(finished.status, WorkflowStatus::Completed);

    orchestrator.cancel(workflow).await.unwrap();
    assert_eq!(orchestrator.snapshot(workflow).unwrap(), finished);
}
