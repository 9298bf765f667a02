use std::collections::HashSet;
use std::time::Duration;

use crate::adapters::tool::{AdapterRequest, AdapterResult, ToolAdapter, validate_against_descriptor};
use crate::execution::{CommandSpec, ProcessSpawnRequest};
use crate::models::{
    AdapterDescriptor, AdapterOptions, CoreError, CoreErrorKind, Finding, OptionKind, OptionSpec,
    Severity, ToolCategory, ToolResult,
};

const SQLMAP_OPTIONS: &[OptionSpec] = &[
    OptionSpec::optional("url", OptionKind::String, "target URL with parameters; defaults to the workflow target"),
    OptionSpec::optional("data", OptionKind::String, "POST body to test"),
    OptionSpec::optional("level", OptionKind::Integer, "test level 1-5"),
    OptionSpec::optional("risk", OptionKind::Integer, "test risk 1-3"),
    OptionSpec::optional("technique", OptionKind::String, "injection techniques, e.g. 'BEUST'"),
    OptionSpec::optional("extra_args", OptionKind::StringList, "additional raw sqlmap arguments"),
];

pub const SQLMAP_DESCRIPTOR: AdapterDescriptor = AdapterDescriptor {
    name: "sqlmap",
    display_name: "sqlmap",
    category: ToolCategory::InjectionTester,
    options: SQLMAP_OPTIONS,
    default_timeout: Some(Duration::from_secs(3600)),
    functional: true,
};

pub(crate) const SQLMAP_COMMAND: &str = "sqlmap";

pub trait SqlmapSource: Send + Sync {
    fn run(&self, request: &AdapterRequest) -> AdapterResult<String>;
}

pub struct SqlmapAdapter<S: SqlmapSource> {
    source: S,
}

impl<S: SqlmapSource> SqlmapAdapter<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }
}

impl<S: SqlmapSource> ToolAdapter for SqlmapAdapter<S> {
    fn descriptor(&self) -> &AdapterDescriptor {
        &SQLMAP_DESCRIPTOR
    }

    fn validate_options(&self, options: &AdapterOptions) -> AdapterResult<()> {
        validate_against_descriptor(&SQLMAP_DESCRIPTOR, options)?;
        check_range(options, "level", 1..=5)?;
        check_range(options, "risk", 1..=3)?;
        if let Some(technique) = options.get("technique").and_then(serde_json::Value::as_str)
            && !technique.chars().all(|c| "BEUSTQ".contains(c))
        {
            return Err(invalid_options(format!(
                "technique '{technique}' may only contain B, E, U, S, T or Q"
            )));
        }
        Ok(())
    }

    fn execute(&self, request: AdapterRequest) -> AdapterResult<ToolResult> {
        let raw = self.source.run(&request)?;
        let findings = parse_sqlmap_output(&raw, request.target_or("url"));
        Ok(ToolResult::completed(SQLMAP_DESCRIPTOR.name, raw, findings))
    }
}

pub fn sqlmap_request(request: &AdapterRequest) -> ProcessSpawnRequest {
    let mut command = CommandSpec::new(SQLMAP_COMMAND)
        .arg("-u")
        .arg(request.target_or("url"))
        .args(["--batch", "--disable-coloring"]);

    if let Some(data) = request.string_option("data") {
        command = command.arg(format!("--data={data}"));
    }
    if let Some(level) = request.integer_option("level") {
        command = command.arg(format!("--level={level}"));
    }
    if let Some(risk) = request.integer_option("risk") {
        command = command.arg(format!("--risk={risk}"));
    }
    if let Some(technique) = request.string_option("technique") {
        command = command.arg(format!("--technique={technique}"));
    }
    command = command.args(request.string_list_option("extra_args"));

    request.spawn_request(SQLMAP_DESCRIPTOR.name, command)
}

#[derive(Default)]
struct InjectionBlock {
    kind: Option<String>,
    title: Option<String>,
    payload: Option<String>,
}

fn parse_sqlmap_output(output: &str, url: &str) -> Vec<Finding> {
    let mut findings = Vec::new();
    let mut seen = HashSet::new();
    let mut parameter: Option<String> = None;
    let mut block = InjectionBlock::default();

    let mut flush = |parameter: &Option<String>, block: &mut InjectionBlock, findings: &mut Vec<Finding>| {
        let taken = std::mem::take(block);
        let (Some(parameter), Some(kind)) = (parameter.as_ref(), taken.kind) else {
            return;
        };
        if !seen.insert((parameter.clone(), kind.clone())) {
            return;
        }
        let severity = if kind.contains("stacked") {
            Severity::Critical
        } else {
            Severity::High
        };
        let mut finding = Finding::new(
            format!("SQL injection in {parameter}: {kind}"),
            severity,
            url.to_string(),
        )
        .description(taken.title.unwrap_or_default());
        if let Some(payload) = taken.payload {
            finding = finding.evidence(payload);
        }
        findings.push(finding);
    };

    for line in output.lines().map(str::trim) {
        if let Some(value) = line.strip_prefix("Parameter:") {
            flush(&parameter, &mut block, &mut findings);
            parameter = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("Type:") {
            flush(&parameter, &mut block, &mut findings);
            block.kind = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("Title:") {
            block.title = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("Payload:") {
            block.payload = Some(value.trim().to_string());
        } else if line == "---" {
            flush(&parameter, &mut block, &mut findings);
            parameter = None;
        }
    }
    flush(&parameter, &mut block, &mut findings);

    findings
}

fn check_range(
    options: &AdapterOptions,
    name: &str,
    range: std::ops::RangeInclusive<i64>,
) -> AdapterResult<()> {
    match options.get(name).and_then(serde_json::Value::as_i64) {
        Some(value) if !range.contains(&value) => Err(invalid_options(format!(
            "{name} must be between {} and {}",
            range.start(),
            range.end()
        ))),
        _ => Ok(()),
    }
}

fn invalid_options(message: String) -> CoreError {
    CoreError::new(CoreErrorKind::InvalidOptions, message).with_adapter(SQLMAP_DESCRIPTOR.name)
}

#[cfg(test)]
mod tests {
    use crate::adapters::tool::{AdapterRequest, ToolAdapter};
    use crate::models::{AdapterOptions, Severity, TaskId, WorkflowId};

    use super::{SqlmapAdapter, SqlmapSource, parse_sqlmap_output, sqlmap_request};
    use crate::adapters::tool::AdapterResult;

    const INJECTABLE_FIXTURE: &str = include_str!("../../tests/fixtures/sqlmap/injectable.txt");
    const CLEAN_FIXTURE: &str = include_str!("../../tests/fixtures/sqlmap/not_injectable.txt");
    const URL: &str = "http://testsite.local/item.php?id=1";

    #[test]
    fn parses_injection_points_once_each() {
        let findings = parse_sqlmap_output(INJECTABLE_FIXTURE, URL);
        assert_eq!(findings.len(), 3);
        assert_eq!(findings[0].title, "SQL injection in id (GET): boolean-based blind");
        assert_eq!(findings[0].severity, Severity::High);
        assert_eq!(findings[0].location, URL);
        assert_eq!(
            findings[0].evidence.as_deref(),
            Some("id=1 AND 6312=6312")
        );
        assert_eq!(findings[1].title, "SQL injection in id (GET): stacked queries");
        assert_eq!(findings[1].severity, Severity::Critical);
        assert_eq!(findings[2].title, "SQL injection in id (GET): time-based blind");
    }

    #[test]
    fn clean_run_has_no_findings() {
        assert!(parse_sqlmap_output(CLEAN_FIXTURE, URL).is_empty());
    }

    #[test]
    fn request_builder_runs_in_batch_mode() {
        let options: AdapterOptions = serde_json::from_value(serde_json::json!({
            "level": 3,
            "risk": 2,
        }))
        .unwrap();
        let request = AdapterRequest::new(WorkflowId(2), TaskId::from("sqli"), URL).options(options);
        let spawn = sqlmap_request(&request);
        assert_eq!(
            spawn.command.args,
            vec!["-u", URL, "--batch", "--disable-coloring", "--level=3", "--risk=2"]
        );
    }

    struct FixtureSource;

    impl SqlmapSource for FixtureSource {
        fn run(&self, _request: &AdapterRequest) -> AdapterResult<String> {
            Ok(INJECTABLE_FIXTURE.to_string())
        }
    }

    #[test]
    fn range_checks_reject_out_of_bounds_values() {
        let adapter = SqlmapAdapter::new(FixtureSource);
        let options: AdapterOptions =
            serde_json::from_value(serde_json::json!({"risk": 4})).unwrap();
        assert!(adapter.validate_options(&options).is_err());
        let options: AdapterOptions =
            serde_json::from_value(serde_json::json!({"technique": "BX"})).unwrap();
        assert!(adapter.validate_options(&options).is_err());
    }

    #[test]
    fn adapter_uses_url_option_as_location() {
        let adapter = SqlmapAdapter::new(FixtureSource);
        let options: AdapterOptions =
            serde_json::from_value(serde_json::json!({"url": "http://other.local/?q=1"})).unwrap();
        let request =
            AdapterRequest::new(WorkflowId(2), TaskId::from("sqli"), URL).options(options);
        let result = adapter.execute(request).unwrap();
        assert!(
            result
                .findings
                .iter()
                .all(|finding| finding.location == "http://other.local/?q=1")
        );
    }
}
