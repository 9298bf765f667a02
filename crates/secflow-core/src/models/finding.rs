use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::{CoreError, CoreErrorKind, TaskId, WorkflowId};

const MAX_RAW_OUTPUT_BYTES: usize = 128 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 5] = [
        Severity::Critical,
        Severity::High,
        Severity::Medium,
        Severity::Low,
        Severity::Info,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Info => "info",
        }
    }

    /// Lenient mapping for tool-reported severity labels.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "critical" => Some(Self::Critical),
            "high" => Some(Self::High),
            "medium" | "moderate" => Some(Self::Medium),
            "low" => Some(Self::Low),
            "info" | "informational" | "unknown" | "none" => Some(Self::Info),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub title: String,
    pub description: String,
    pub severity: Severity,
    pub location: String,
    pub evidence: Option<String>,
}

impl Finding {
    pub fn new(title: impl Into<String>, severity: Severity, location: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            severity,
            location: location.into(),
            evidence: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn evidence(mut self, evidence: impl Into<String>) -> Self {
        let evidence = evidence.into();
        self.evidence = (!evidence.trim().is_empty()).then_some(evidence);
        self
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Completed,
    Failed,
    Timeout,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool: String,
    pub status: ToolStatus,
    pub raw_output: String,
    pub findings: Vec<Finding>,
    pub error: Option<String>,
    pub execution_time: Duration,
}

impl ToolResult {
    pub fn completed(tool: impl Into<String>, raw_output: String, findings: Vec<Finding>) -> Self {
        Self {
            tool: tool.into(),
            status: ToolStatus::Completed,
            raw_output: tail_window(raw_output),
            findings,
            error: None,
            execution_time: Duration::ZERO,
        }
    }

    /// Classifies an adapter-side error into a failed or timed-out result.
    pub fn from_error(tool: impl Into<String>, error: &CoreError) -> Self {
        let status = if error.kind == CoreErrorKind::Timeout {
            ToolStatus::Timeout
        } else {
            ToolStatus::Failed
        };
        Self {
            tool: tool.into(),
            status,
            raw_output: String::new(),
            findings: Vec::new(),
            error: Some(error.message.clone()),
            execution_time: Duration::ZERO,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ToolStatus::Completed
    }
}

fn tail_window(raw_output: String) -> String {
    if raw_output.len() <= MAX_RAW_OUTPUT_BYTES {
        return raw_output;
    }
    let mut start = raw_output.len() - MAX_RAW_OUTPUT_BYTES;
    while !raw_output.is_char_boundary(start) {
        start += 1;
    }
    raw_output[start..].to_string()
}

/// Severity counters for a workflow.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FindingsSummary(BTreeMap<Severity, u64>);

impl FindingsSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, severity: Severity) {
        *self.0.entry(severity).or_insert(0) += 1;
    }

    pub fn record_all<'a>(&mut self, findings: impl IntoIterator<Item = &'a Finding>) {
        for finding in findings {
            self.record(finding.severity);
        }
    }

    pub fn count(&self, severity: Severity) -> u64 {
        self.0.get(&severity).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    pub fn highest_severity(&self) -> Option<Severity> {
        self.0
            .iter()
            .rev()
            .find(|(_, count)| **count > 0)
            .map(|(severity, _)| *severity)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Severity, u64)> + '_ {
        self.0.iter().map(|(severity, count)| (*severity, *count))
    }
}

/// A finding flattened out of a workflow with its provenance.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExportedFinding {
    pub workflow_id: WorkflowId,
    pub target: String,
    pub task_id: TaskId,
    pub adapter: String,
    #[serde(flatten)]
    pub finding: Finding,
}

#[cfg(test)]
mod tests {
    use super::{Finding, FindingsSummary, MAX_RAW_OUTPUT_BYTES, Severity, ToolResult};

    #[test]
    fn summary_counts_and_reports_highest_severity() {
        let mut summary = FindingsSummary::new();
        assert_eq!(summary.highest_severity(), None);

        summary.record(Severity::Low);
        summary.record(Severity::High);
        summary.record(Severity::Low);

        assert_eq!(summary.count(Severity::Low), 2);
        assert_eq!(summary.count(Severity::Critical), 0);
        assert_eq!(summary.total(), 3);
        assert_eq!(summary.highest_severity(), Some(Severity::High));
    }

    #[test]
    fn severity_labels_are_mapped_leniently() {
        assert_eq!(Severity::from_label("HIGH"), Some(Severity::High));
        assert_eq!(Severity::from_label("Informational"), Some(Severity::Info));
        assert_eq!(Severity::from_label("UNKNOWN"), Some(Severity::Info));
        assert_eq!(Severity::from_label("bogus"), None);
    }

    #[test]
    fn raw_output_keeps_trailing_window() {
        let raw = "x".repeat(MAX_RAW_OUTPUT_BYTES + 10);
        let result = ToolResult::completed("nmap", raw, Vec::new());
        assert_eq!(result.raw_output.len(), MAX_RAW_OUTPUT_BYTES);
    }

    #[test]
    fn blank_evidence_is_dropped() {
        let finding = Finding::new("t", Severity::Info, "loc").evidence("  ");
        assert!(finding.evidence.is_none());
    }
}
