mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Behavior, ScriptedAdapter, finding, registry_with};
use secflow_core::aggregation::{export_findings, recompute_summary};
use secflow_core::models::{CoreErrorKind, NewTask, Severity, TaskId, TaskStatus, WorkflowStatus};
use secflow_core::orchestration::Orchestrator;

const WAIT: Option<Duration> = Some(Duration::from_secs(10));

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn incremental_summary_matches_recomputation() {
    let probe = Arc::new(
        ScriptedAdapter::named("probe")
            .script(
                "ports",
                Behavior::Succeed(vec![
                    finding("Open port 22", Severity::Info),
                    finding("Open port 80", Severity::Info),
                ]),
            )
            .script(
                "web",
                Behavior::Succeed(vec![
                    finding("Outdated server banner", Severity::Low),
                    finding("Reflected XSS", Severity::High),
                ]),
            )
            .script(
                "sqli",
                Behavior::PartialFailure(vec![finding("Boolean-based injection", Severity::Critical)]),
            ),
    );
    let orchestrator = Orchestrator::new(registry_with(vec![probe]));
    let workflow = orchestrator
        .create_workflow("aggregate", "", "example.com")
        .await
        .unwrap();
    orchestrator
        .add_task(workflow, NewTask::new("probe").id("ports"))
        .await
        .unwrap();
    orchestrator
        .add_task(workflow, NewTask::new("probe").id("web").depends_on("ports"))
        .await
        .unwrap();
    orchestrator
        .add_task(workflow, NewTask::new("probe").id("sqli").depends_on("ports"))
        .await
        .unwrap();

    orchestrator.execute(workflow).await.unwrap();
    let record = orchestrator.wait_for_terminal(workflow, WAIT).await.unwrap();
    assert_eq!(record.status, WorkflowStatus::Failed);

    assert_eq!(record.findings_summary, recompute_summary(&record));
    assert_eq!(record.findings_summary.total(), 4);
    assert_eq!(record.findings_summary.count(Severity::Info), 2);
    assert_eq!(record.findings_summary.count(Severity::Critical), 0);
    assert_eq!(record.findings_summary.highest_severity(), Some(Severity::High));

    let sqli = record.task(&TaskId::new("sqli")).unwrap();
    assert_eq!(sqli.status, TaskStatus::Failed);
    assert_eq!(
        sqli.error.as_ref().map(|error| error.kind),
        Some(CoreErrorKind::ProcessFailure)
    );
    assert_eq!(sqli.result.as_ref().map(|result| result.findings.len()), Some(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn export_preserves_provenance_and_task_order() {
    let probe = Arc::new(
        ScriptedAdapter::named("probe")
            .script("first", Behavior::Succeed(vec![finding("A", Severity::Medium)]))
            .script(
                "second",
                Behavior::Succeed(vec![
                    finding("B", Severity::Low),
                    finding("C", Severity::High),
                ]),
            )
            .script("broken", Behavior::Fail),
    );
    let orchestrator = Orchestrator::new(registry_with(vec![probe]));
    let workflow = orchestrator
        .create_workflow("export", "", "example.com")
        .await
        .unwrap();
    for id in ["first", "broken", "second"] {
        orchestrator
            .add_task(workflow, NewTask::new("probe").id(id))
            .await
            .unwrap();
    }

    orchestrator.execute(workflow).await.unwrap();
    let record = orchestrator.wait_for_terminal(workflow, WAIT).await.unwrap();

    // Partial results stay readable after the workflow fails.
    assert_eq!(record.status, WorkflowStatus::Failed);
    let exported = orchestrator.findings(workflow).unwrap();
    assert_eq!(exported, export_findings(&record));

    let titles: Vec<&str> = exported
        .iter()
        .map(|entry| entry.finding.title.as_str())
        .collect();
    assert_eq!(titles, vec!["A", "B", "C"]);
    assert!(exported.iter().all(|entry| {
        entry.workflow_id == workflow && entry.target == "example.com" && entry.adapter == "probe"
    }));
    assert_eq!(exported[0].task_id, TaskId::new("first"));
    assert_eq!(exported[2].task_id, TaskId::new("second"));
}
