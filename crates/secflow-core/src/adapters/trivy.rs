use std::time::Duration;

use serde::Deserialize;

use crate::adapters::tool::{AdapterRequest, AdapterResult, ToolAdapter, validate_against_descriptor};
use crate::execution::{CommandSpec, ProcessSpawnRequest};
use crate::models::{
    AdapterDescriptor, AdapterOptions, CoreError, CoreErrorKind, Finding, OptionKind, OptionSpec,
    Severity, ToolCategory, ToolResult,
};

const TRIVY_OPTIONS: &[OptionSpec] = &[
    OptionSpec::optional("image", OptionKind::String, "image reference; defaults to the workflow target"),
    OptionSpec::optional("severity", OptionKind::StringList, "severities to report"),
    OptionSpec::optional("ignore_unfixed", OptionKind::Boolean, "skip vulnerabilities without a fix"),
    OptionSpec::optional("extra_args", OptionKind::StringList, "additional raw trivy arguments"),
];

pub const TRIVY_DESCRIPTOR: AdapterDescriptor = AdapterDescriptor {
    name: "trivy",
    display_name: "Trivy",
    category: ToolCategory::ContainerScanner,
    options: TRIVY_OPTIONS,
    default_timeout: Some(Duration::from_secs(900)),
    functional: true,
};

pub(crate) const TRIVY_COMMAND: &str = "trivy";

pub trait TrivySource: Send + Sync {
    fn scan_image(&self, request: &AdapterRequest) -> AdapterResult<String>;
}

pub struct TrivyAdapter<S: TrivySource> {
    source: S,
}

impl<S: TrivySource> TrivyAdapter<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }
}

impl<S: TrivySource> ToolAdapter for TrivyAdapter<S> {
    fn descriptor(&self) -> &AdapterDescriptor {
        &TRIVY_DESCRIPTOR
    }

    fn validate_options(&self, options: &AdapterOptions) -> AdapterResult<()> {
        validate_against_descriptor(&TRIVY_DESCRIPTOR, options)?;
        if let Some(labels) = options.get("severity").and_then(serde_json::Value::as_array) {
            for label in labels.iter().filter_map(serde_json::Value::as_str) {
                if Severity::from_label(label).is_none() {
                    return Err(CoreError::new(
                        CoreErrorKind::InvalidOptions,
                        format!("unknown severity '{label}'"),
                    )
                    .with_adapter(TRIVY_DESCRIPTOR.name));
                }
            }
        }
        Ok(())
    }

    fn execute(&self, request: AdapterRequest) -> AdapterResult<ToolResult> {
        let raw = self.source.scan_image(&request)?;
        let findings = parse_trivy_report(&raw)?;
        Ok(ToolResult::completed(TRIVY_DESCRIPTOR.name, raw, findings))
    }
}

pub fn trivy_image_request(request: &AdapterRequest) -> ProcessSpawnRequest {
    let mut command =
        CommandSpec::new(TRIVY_COMMAND).args(["image", "--format", "json", "--quiet"]);

    let severities = request.string_list_option("severity");
    if !severities.is_empty() {
        let joined = severities
            .iter()
            .map(|label| label.to_ascii_uppercase())
            .collect::<Vec<_>>()
            .join(",");
        command = command.arg("--severity").arg(joined);
    }
    if request.bool_option("ignore_unfixed") {
        command = command.arg("--ignore-unfixed");
    }
    command = command.args(request.string_list_option("extra_args"));
    command = command.arg(request.target_or("image"));

    request.spawn_request(TRIVY_DESCRIPTOR.name, command)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TrivyReport {
    #[serde(default)]
    artifact_name: Option<String>,
    #[serde(default)]
    results: Vec<TrivyTargetResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TrivyTargetResult {
    target: String,
    #[serde(default)]
    vulnerabilities: Option<Vec<TrivyVulnerability>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TrivyVulnerability {
    #[serde(rename = "VulnerabilityID")]
    vulnerability_id: String,
    pkg_name: String,
    installed_version: Option<String>,
    fixed_version: Option<String>,
    severity: Option<String>,
    title: Option<String>,
    description: Option<String>,
}

fn parse_trivy_report(output: &str) -> AdapterResult<Vec<Finding>> {
    let report: TrivyReport = serde_json::from_str(output).map_err(|error| {
        CoreError::new(
            CoreErrorKind::ParseFailure,
            format!("invalid trivy JSON report: {error}"),
        )
        .with_adapter(TRIVY_DESCRIPTOR.name)
    })?;
    let artifact = report.artifact_name.unwrap_or_default();

    let mut findings = Vec::new();
    for result in report.results {
        for vulnerability in result.vulnerabilities.unwrap_or_default() {
            let installed = vulnerability.installed_version.unwrap_or_default();
            let title = match vulnerability.title.as_deref().map(str::trim) {
                Some(title) if !title.is_empty() => {
                    format!("{}: {title}", vulnerability.vulnerability_id)
                }
                _ => format!(
                    "{} in {}",
                    vulnerability.vulnerability_id, vulnerability.pkg_name
                ),
            };
            let location = if artifact.is_empty() {
                format!("{} ({})", result.target, vulnerability.pkg_name)
            } else {
                format!("{artifact} {} {installed}", vulnerability.pkg_name)
                    .trim_end()
                    .to_string()
            };
            let evidence = match vulnerability.fixed_version.as_deref() {
                Some(fixed) if !fixed.is_empty() => {
                    format!("{} {installed} (fixed in {fixed})", vulnerability.pkg_name)
                }
                _ => format!("{} {installed} (no fix available)", vulnerability.pkg_name),
            };

            findings.push(
                Finding::new(
                    title,
                    vulnerability
                        .severity
                        .as_deref()
                        .and_then(Severity::from_label)
                        .unwrap_or(Severity::Info),
                    location,
                )
                .description(vulnerability.description.unwrap_or_default())
                .evidence(evidence),
            );
        }
    }

    Ok(findings)
}
