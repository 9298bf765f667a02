//! Cross-tool result aggregation.
//!
//! Only tasks that ended `completed` contribute findings. Partial output kept on
//! failed or timed-out results is retained for inspection but never counted.

use crate::models::{
    ExportedFinding, FindingsSummary, TaskRecord, TaskStatus, ToolResult, WorkflowRecord,
};

fn contributing_result(task: &TaskRecord) -> Option<&ToolResult> {
    if task.status != TaskStatus::Completed {
        return None;
    }
    task.result.as_ref().filter(|result| result.is_success())
}

/// Folds one task's findings into the running summary.
pub fn apply_task(summary: &mut FindingsSummary, task: &TaskRecord) {
    if let Some(result) = contributing_result(task) {
        summary.record_all(&result.findings);
    }
}

/// Rebuilds the summary from scratch over the workflow's completed tasks.
pub fn recompute_summary(workflow: &WorkflowRecord) -> FindingsSummary {
    let mut summary = FindingsSummary::new();
    for task in &workflow.tasks {
        apply_task(&mut summary, task);
    }
    summary
}

/// Flattens findings in task insertion order, then result order.
pub fn export_findings(workflow: &WorkflowRecord) -> Vec<ExportedFinding> {
    workflow
        .tasks
        .iter()
        .filter_map(|task| contributing_result(task).map(|result| (task, result)))
        .flat_map(|(task, result)| {
            result.findings.iter().map(move |finding| ExportedFinding {
                workflow_id: workflow.id,
                target: workflow.target.clone(),
                task_id: task.id.clone(),
                adapter: task.adapter.clone(),
                finding: finding.clone(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use crate::models::{
        AdapterOptions, CoreError, CoreErrorKind, Finding, Severity, TaskId, TaskRecord,
        TaskStatus, ToolResult, WorkflowId, WorkflowRecord,
    };

    use super::{apply_task, export_findings, recompute_summary};

    fn task(id: &str, adapter: &str, status: TaskStatus, result: Option<ToolResult>) -> TaskRecord {
        let mut task = TaskRecord::pending(
            TaskId::from(id),
            adapter,
            AdapterOptions::new(),
            BTreeSet::new(),
        );
        task.status = status;
        task.result = result;
        task
    }

    fn workflow() -> WorkflowRecord {
        let mut workflow = WorkflowRecord::new(WorkflowId(7), "audit", "", "example.com");
        workflow.tasks = vec![
            task(
                "ports",
                "nmap",
                TaskStatus::Completed,
                Some(ToolResult::completed(
                    "nmap",
                    String::new(),
                    vec![
                        Finding::new("Open port 21/tcp (ftp)", Severity::Medium, "10.0.0.1:21"),
                        Finding::new("Open port 22/tcp (ssh)", Severity::Info, "10.0.0.1:22"),
                    ],
                )),
            ),
            task(
                "web",
                "nuclei",
                TaskStatus::Failed,
                Some(ToolResult::from_error(
                    "nuclei",
                    &CoreError::new(CoreErrorKind::Timeout, "timed out"),
                )),
            ),
            task(
                "vulns",
                "nuclei",
                TaskStatus::Completed,
                Some(ToolResult::completed(
                    "nuclei",
                    String::new(),
                    vec![Finding::new("Struts RCE", Severity::Critical, "https://example.com")],
                )),
            ),
            task("later", "sqlmap", TaskStatus::Skipped, None),
        ];
        workflow
    }

    #[test]
    fn incremental_summary_matches_recomputation() {
        let workflow = workflow();
        let mut incremental = crate::models::FindingsSummary::new();
        for task in &workflow.tasks {
            apply_task(&mut incremental, task);
        }

        assert_eq!(incremental, recompute_summary(&workflow));
        assert_eq!(incremental.total(), 3);
        assert_eq!(incremental.count(Severity::Critical), 1);
        assert_eq!(incremental.highest_severity(), Some(Severity::Critical));
    }

    #[test]
    fn failed_results_do_not_contribute() {
        let mut workflow = workflow();
        let mut partial = ToolResult::completed(
            "nikto",
            String::new(),
            vec![Finding::new("Partial", Severity::High, "/")],
        );
        partial.status = crate::models::ToolStatus::Timeout;
        workflow
            .tasks
            .push(task("partial", "nikto", TaskStatus::Failed, Some(partial)));

        assert_eq!(recompute_summary(&workflow).count(Severity::High), 0);
        assert!(export_findings(&workflow).iter().all(|f| f.task_id.as_str() != "partial"));
    }

    #[test]
    fn export_keeps_task_then_finding_order_with_provenance() {
        let exported = export_findings(&workflow());
        let titles: Vec<&str> = exported.iter().map(|f| f.finding.title.as_str()).collect();
        assert_eq!(
            titles,
            vec!["Open port 21/tcp (ftp)", "Open port 22/tcp (ssh)", "Struts RCE"]
        );
        assert_eq!(exported[2].task_id, TaskId::from("vulns"));
        assert_eq!(exported[2].adapter, "nuclei");
        assert_eq!(exported[0].workflow_id, WorkflowId(7));
        assert_eq!(exported[0].target, "example.com");
    }
}
