use std::time::Duration;

use serde::Deserialize;

use crate::adapters::tool::{AdapterRequest, AdapterResult, ToolAdapter, validate_against_descriptor};
use crate::execution::{CommandSpec, ProcessSpawnRequest};
use crate::models::{
    AdapterDescriptor, AdapterOptions, CoreError, CoreErrorKind, Finding, OptionKind, OptionSpec,
    Severity, ToolCategory, ToolResult,
};

const NUCLEI_OPTIONS: &[OptionSpec] = &[
    OptionSpec::optional("url", OptionKind::String, "target URL; defaults to the workflow target"),
    OptionSpec::optional("templates", OptionKind::StringList, "template paths or directories (-t)"),
    OptionSpec::optional("tags", OptionKind::StringList, "template tags to include"),
    OptionSpec::optional("severity", OptionKind::StringList, "severities to include"),
    OptionSpec::optional("rate_limit", OptionKind::Integer, "maximum requests per second"),
    OptionSpec::optional("extra_args", OptionKind::StringList, "additional raw nuclei arguments"),
];

pub const NUCLEI_DESCRIPTOR: AdapterDescriptor = AdapterDescriptor {
    name: "nuclei",
    display_name: "Nuclei",
    category: ToolCategory::TemplateScanner,
    options: NUCLEI_OPTIONS,
    default_timeout: Some(Duration::from_secs(1800)),
    functional: true,
};

pub(crate) const NUCLEI_COMMAND: &str = "nuclei";

pub trait NucleiSource: Send + Sync {
    fn scan(&self, request: &AdapterRequest) -> AdapterResult<String>;
}

pub struct NucleiAdapter<S: NucleiSource> {
    source: S,
}

impl<S: NucleiSource> NucleiAdapter<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }
}

impl<S: NucleiSource> ToolAdapter for NucleiAdapter<S> {
    fn descriptor(&self) -> &AdapterDescriptor {
        &NUCLEI_DESCRIPTOR
    }

    fn validate_options(&self, options: &AdapterOptions) -> AdapterResult<()> {
        validate_against_descriptor(&NUCLEI_DESCRIPTOR, options)?;

        if let Some(severities) = options.get("severity").and_then(serde_json::Value::as_array) {
            for label in severities.iter().filter_map(serde_json::Value::as_str) {
                if Severity::from_label(label).is_none() {
                    return Err(CoreError::new(
                        CoreErrorKind::InvalidOptions,
                        format!("unknown severity '{label}'"),
                    )
                    .with_adapter(NUCLEI_DESCRIPTOR.name));
                }
            }
        }
        Ok(())
    }

    fn execute(&self, request: AdapterRequest) -> AdapterResult<ToolResult> {
        let raw = self.source.scan(&request)?;
        let findings = parse_nuclei_jsonl(&raw)?;
        Ok(ToolResult::completed(NUCLEI_DESCRIPTOR.name, raw, findings))
    }
}

pub fn nuclei_scan_request(request: &AdapterRequest) -> ProcessSpawnRequest {
    let mut command = CommandSpec::new(NUCLEI_COMMAND)
        .args(["-jsonl", "-silent", "-no-color", "-u"])
        .arg(request.target_or("url"));

    for template in request.string_list_option("templates") {
        command = command.arg("-t").arg(template);
    }
    let tags = request.string_list_option("tags");
    if !tags.is_empty() {
        command = command.arg("-tags").arg(tags.join(","));
    }
    let severities = request.string_list_option("severity");
    if !severities.is_empty() {
        command = command.arg("-severity").arg(severities.join(","));
    }
    if let Some(rate_limit) = request.integer_option("rate_limit") {
        command = command.arg("-rl").arg(rate_limit.to_string());
    }
    command = command.args(request.string_list_option("extra_args"));

    request.spawn_request(NUCLEI_DESCRIPTOR.name, command)
}

#[derive(Debug, Deserialize)]
struct NucleiEvent {
    #[serde(rename = "template-id")]
    template_id: Option<String>,
    info: Option<NucleiInfo>,
    #[serde(rename = "matched-at")]
    matched_at: Option<String>,
    host: Option<String>,
    #[serde(rename = "matcher-name")]
    matcher_name: Option<String>,
    #[serde(rename = "extracted-results", default)]
    extracted_results: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct NucleiInfo {
    name: Option<String>,
    severity: Option<String>,
    description: Option<String>,
}

fn parse_nuclei_jsonl(output: &str) -> AdapterResult<Vec<Finding>> {
    let mut findings = Vec::new();

    for (index, line) in output.lines().map(str::trim).enumerate() {
        if !line.starts_with('{') {
            continue;
        }
        let event: NucleiEvent = serde_json::from_str(line).map_err(|error| {
            parse_error(format!("invalid nuclei JSON on line {}: {error}", index + 1))
        })?;

        let info = event.info.as_ref();
        let template_id = event.template_id.as_deref().unwrap_or("unknown-template");
        let title = info
            .and_then(|info| info.name.as_deref())
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(template_id)
            .to_string();
        let severity = info
            .and_then(|info| info.severity.as_deref())
            .and_then(Severity::from_label)
            .unwrap_or(Severity::Info);
        let location = event
            .matched_at
            .as_deref()
            .or(event.host.as_deref())
            .unwrap_or_default()
            .to_string();

        let mut finding = Finding::new(title, severity, location).description(
            info.and_then(|info| info.description.as_deref())
                .map(str::trim)
                .unwrap_or_default()
                .to_string(),
        );
        let evidence = if event.extracted_results.is_empty() {
            event.matcher_name.clone().unwrap_or_default()
        } else {
            event.extracted_results.join(", ")
        };
        finding = finding.evidence(evidence);
        findings.push(finding);
    }

    Ok(findings)
}

fn parse_error(message: String) -> CoreError {
    CoreError::new(CoreErrorKind::ParseFailure, message).with_adapter(NUCLEI_DESCRIPTOR.name)
}

#[cfg(test)]
mod tests {
    use crate::adapters::tool::{AdapterRequest, AdapterResult, ToolAdapter};
    use crate::models::{AdapterOptions, CoreErrorKind, Severity, TaskId, WorkflowId};

    use super::{NucleiAdapter, NucleiSource, nuclei_scan_request, parse_nuclei_jsonl};

    const SCAN_FIXTURE: &str = include_str!("../../tests/fixtures/nuclei/scan.jsonl");

    fn request(options: serde_json::Value) -> AdapterRequest {
        let options: AdapterOptions = serde_json::from_value(options).unwrap();
        AdapterRequest::new(WorkflowId(1), TaskId::from("templates"), "https://example.com")
            .options(options)
    }

    #[test]
    fn parses_findings_from_fixture() {
        let findings = parse_nuclei_jsonl(SCAN_FIXTURE).unwrap();
        assert_eq!(findings.len(), 3);

        assert_eq!(findings[0].title, "Apache Struts2 S2-045 RCE");
        assert_eq!(findings[0].severity, Severity::Critical);
        assert_eq!(findings[0].location, "https://example.com/index.action");

        assert_eq!(findings[1].severity, Severity::Info);
        assert_eq!(findings[1].evidence.as_deref(), Some("nginx/1.18.0"));

        assert_eq!(findings[2].title, "missing-csp");
        assert_eq!(findings[2].evidence.as_deref(), Some("content-security-policy"));
    }

    #[test]
    fn empty_output_means_no_findings() {
        assert!(parse_nuclei_jsonl("").unwrap().is_empty());
    }

    #[test]
    fn malformed_json_line_is_a_parse_failure() {
        let error = parse_nuclei_jsonl("{\"template-id\": ").unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::ParseFailure);
    }

    #[test]
    fn request_builder_joins_filters() {
        let spawn = nuclei_scan_request(&request(serde_json::json!({
            "tags": ["cve", "exposure"],
            "severity": ["high", "critical"],
            "rate_limit": 50,
        })));
        assert_eq!(
            spawn.command.args,
            vec![
                "-jsonl",
                "-silent",
                "-no-color",
                "-u",
                "https://example.com",
                "-tags",
                "cve,exposure",
                "-severity",
                "high,critical",
                "-rl",
                "50",
            ]
        );
    }

    struct FixtureSource;

    impl NucleiSource for FixtureSource {
        fn scan(&self, _request: &AdapterRequest) -> AdapterResult<String> {
            Ok(SCAN_FIXTURE.to_string())
        }
    }

    #[test]
    fn rejects_unknown_severity_filter() {
        let adapter = NucleiAdapter::new(FixtureSource);
        let options: AdapterOptions =
            serde_json::from_value(serde_json::json!({"severity": ["spicy"]})).unwrap();
        assert_eq!(
            adapter.validate_options(&options).unwrap_err().kind,
            CoreErrorKind::InvalidOptions
        );
    }

    #[test]
    fn adapter_returns_fixture_findings() {
        let adapter = NucleiAdapter::new(FixtureSource);
        let result = adapter.execute(request(serde_json::json!({}))).unwrap();
        assert!(result.is_success());
        assert_eq!(result.findings.len(), 3);
    }
}
