use std::time::Duration;

use crate::adapters::tool::{AdapterRequest, AdapterResult, ToolAdapter, validate_against_descriptor};
use crate::execution::{CommandSpec, ProcessSpawnRequest};
use crate::models::{
    AdapterDescriptor, AdapterOptions, CoreError, CoreErrorKind, Finding, OptionKind, OptionSpec,
    Severity, ToolCategory, ToolResult,
};

const NIKTO_OPTIONS: &[OptionSpec] = &[
    OptionSpec::optional("host", OptionKind::String, "host or URL to scan; defaults to the workflow target"),
    OptionSpec::optional("port", OptionKind::Integer, "port to scan"),
    OptionSpec::optional("ssl", OptionKind::Boolean, "force SSL"),
    OptionSpec::optional("tuning", OptionKind::String, "nikto tuning categories"),
    OptionSpec::optional("extra_args", OptionKind::StringList, "additional raw nikto arguments"),
];

pub const NIKTO_DESCRIPTOR: AdapterDescriptor = AdapterDescriptor {
    name: "nikto",
    display_name: "Nikto",
    category: ToolCategory::WebServerScanner,
    options: NIKTO_OPTIONS,
    default_timeout: Some(Duration::from_secs(2700)),
    functional: true,
};

pub(crate) const NIKTO_COMMAND: &str = "nikto";

/// nikto exits 1 when it reported items.
pub(crate) const NIKTO_ACCEPTED_EXIT_CODES: &[i32] = &[0, 1];

const METADATA_PREFIXES: &[&str] = &[
    "Target IP:",
    "Target Hostname:",
    "Target Port:",
    "Start Time:",
    "End Time:",
    "SSL Info:",
    "Subject:",
    "Ciphers:",
    "Issuer:",
    "Platform:",
    "Scan terminated:",
];

pub trait NiktoSource: Send + Sync {
    fn scan(&self, request: &AdapterRequest) -> AdapterResult<String>;
}

pub struct NiktoAdapter<S: NiktoSource> {
    source: S,
}

impl<S: NiktoSource> NiktoAdapter<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }
}

impl<S: NiktoSource> ToolAdapter for NiktoAdapter<S> {
    fn descriptor(&self) -> &AdapterDescriptor {
        &NIKTO_DESCRIPTOR
    }

    fn validate_options(&self, options: &AdapterOptions) -> AdapterResult<()> {
        validate_against_descriptor(&NIKTO_DESCRIPTOR, options)?;
        if let Some(port) = options.get("port").and_then(serde_json::Value::as_i64)
            && !(1..=65535).contains(&port)
        {
            return Err(CoreError::new(
                CoreErrorKind::InvalidOptions,
                format!("port {port} is out of range"),
            )
            .with_adapter(NIKTO_DESCRIPTOR.name));
        }
        Ok(())
    }

    fn execute(&self, request: AdapterRequest) -> AdapterResult<ToolResult> {
        let raw = self.source.scan(&request)?;
        let findings = parse_nikto_output(&raw, request.target_or("host"));
        Ok(ToolResult::completed(NIKTO_DESCRIPTOR.name, raw, findings))
    }
}

pub fn nikto_scan_request(request: &AdapterRequest) -> ProcessSpawnRequest {
    let mut command = CommandSpec::new(NIKTO_COMMAND)
        .arg("-h")
        .arg(request.target_or("host"))
        .args(["-nointeractive", "-ask", "no"]);

    if let Some(port) = request.integer_option("port") {
        command = command.arg("-p").arg(port.to_string());
    }
    if request.bool_option("ssl") {
        command = command.arg("-ssl");
    }
    if let Some(tuning) = request.string_option("tuning") {
        command = command.arg("-Tuning").arg(tuning);
    }
    command = command.args(request.string_list_option("extra_args"));

    request.spawn_request(NIKTO_DESCRIPTOR.name, command)
}

fn parse_nikto_output(output: &str, host: &str) -> Vec<Finding> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("+ "))
        .map(str::trim)
        .filter(|item| !item.is_empty() && !is_metadata(item))
        .map(|item| nikto_finding(item, host))
        .collect()
}

fn is_metadata(item: &str) -> bool {
    METADATA_PREFIXES.iter().any(|prefix| item.starts_with(prefix))
        || item.contains("host(s) tested")
        || item.contains("requests:")
}

fn nikto_finding(item: &str, host: &str) -> Finding {
    let item = ["GET ", "POST ", "HEAD ", "OPTIONS "]
        .iter()
        .find_map(|method| item.strip_prefix(method))
        .unwrap_or(item);

    let (path, message) = match item.split_once(": ") {
        Some((path, message)) if path.starts_with('/') => (Some(path), message),
        _ => (None, item),
    };
    let (message, reference) = match message.split_once(" See: ") {
        Some((message, reference)) => (message.trim(), Some(reference.trim())),
        None => (message.trim(), None),
    };

    let location = match path {
        Some(path) => format!("{}{path}", host.trim_end_matches('/')),
        None => host.to_string(),
    };
    let title = message
        .split_once(". ")
        .map(|(first, _)| first)
        .unwrap_or(message)
        .trim_end_matches('.')
        .to_string();

    let mut finding = Finding::new(title, classify(message), location).description(message);
    if let Some(reference) = reference {
        finding = finding.evidence(reference);
    }
    finding
}

fn classify(message: &str) -> Severity {
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("cve-") || lowered.contains("vulnerab") || lowered.contains("remote code")
    {
        Severity::Medium
    } else if lowered.starts_with("server:") || lowered.starts_with("retrieved") {
        Severity::Info
    } else {
        Severity::Low
    }
}

#[cfg(test)]
mod tests {
    use crate::adapters::tool::{AdapterRequest, AdapterResult, ToolAdapter};
    use crate::models::{AdapterOptions, Severity, TaskId, WorkflowId};

    use super::{NiktoAdapter, NiktoSource, nikto_scan_request, parse_nikto_output};

    const SCAN_FIXTURE: &str = include_str!("../../tests/fixtures/nikto/scan.txt");

    #[test]
    fn parses_items_and_skips_metadata() {
        let findings = parse_nikto_output(SCAN_FIXTURE, "http://10.0.0.5/");
        assert_eq!(findings.len(), 5);

        assert_eq!(findings[0].title, "Server: nginx/1.18.0 (Ubuntu)");
        assert_eq!(findings[0].severity, Severity::Info);
        assert_eq!(findings[0].location, "http://10.0.0.5/");

        assert_eq!(
            findings[1].title,
            "The anti-clickjacking X-Frame-Options header is not present"
        );
        assert_eq!(findings[1].location, "http://10.0.0.5/");
        assert_eq!(
            findings[1].evidence.as_deref(),
            Some("https://developer.mozilla.org/en-US/docs/Web/HTTP/Headers/X-Frame-Options")
        );
        assert_eq!(findings[1].severity, Severity::Low);

        assert_eq!(findings[3].location, "http://10.0.0.5/admin/");
        assert_eq!(findings[4].severity, Severity::Medium);
    }

    #[test]
    fn request_builder_disables_prompts() {
        let options: AdapterOptions =
            serde_json::from_value(serde_json::json!({"port": 8443, "ssl": true})).unwrap();
        let request =
            AdapterRequest::new(WorkflowId(3), TaskId::from("web"), "10.0.0.5").options(options);
        let spawn = nikto_scan_request(&request);
        assert_eq!(
            spawn.command.args,
            vec!["-h", "10.0.0.5", "-nointeractive", "-ask", "no", "-p", "8443", "-ssl"]
        );
    }

    struct FixtureSource;

    impl NiktoSource for FixtureSource {
        fn scan(&self, _request: &AdapterRequest) -> AdapterResult<String> {
            Ok(SCAN_FIXTURE.to_string())
        }
    }

    #[test]
    fn rejects_out_of_range_port() {
        let adapter = NiktoAdapter::new(FixtureSource);
        let options: AdapterOptions =
            serde_json::from_value(serde_json::json!({"port": 70000})).unwrap();
        assert!(adapter.validate_options(&options).is_err());
    }
}
