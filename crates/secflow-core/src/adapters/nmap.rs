use std::time::Duration;

use crate::adapters::tool::{AdapterRequest, AdapterResult, ToolAdapter, validate_against_descriptor};
use crate::execution::{CommandSpec, ProcessSpawnRequest};
use crate::models::{
    AdapterDescriptor, AdapterOptions, CoreError, CoreErrorKind, Finding, OptionKind, OptionSpec,
    Severity, ToolCategory, ToolResult,
};

const NMAP_OPTIONS: &[OptionSpec] = &[
    OptionSpec::optional("target", OptionKind::String, "hosts to scan; defaults to the workflow target"),
    OptionSpec::optional("ports", OptionKind::String, "port list such as '22,80,8000-8100'"),
    OptionSpec::optional("top_ports", OptionKind::Integer, "scan the N most common ports"),
    OptionSpec::optional("service_detection", OptionKind::Boolean, "probe open ports for service versions (-sV)"),
    OptionSpec::optional("timing", OptionKind::Integer, "timing template 0-5 (-T)"),
    OptionSpec::optional("extra_args", OptionKind::StringList, "additional raw nmap arguments"),
];

pub const NMAP_DESCRIPTOR: AdapterDescriptor = AdapterDescriptor {
    name: "nmap",
    display_name: "Nmap",
    category: ToolCategory::NetworkScanner,
    options: NMAP_OPTIONS,
    default_timeout: Some(Duration::from_secs(1800)),
    functional: true,
};

pub(crate) const NMAP_COMMAND: &str = "nmap";

/// Services whose exposure is worth more than an informational note.
const CLEARTEXT_SERVICES: &[&str] = &["telnet", "ftp", "rlogin", "rsh", "rexec", "vnc", "tftp"];

pub trait NmapSource: Send + Sync {
    fn scan(&self, request: &AdapterRequest) -> AdapterResult<String>;
}

pub struct NmapAdapter<S: NmapSource> {
    source: S,
}

impl<S: NmapSource> NmapAdapter<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }
}

impl<S: NmapSource> ToolAdapter for NmapAdapter<S> {
    fn descriptor(&self) -> &AdapterDescriptor {
        &NMAP_DESCRIPTOR
    }

    fn validate_options(&self, options: &AdapterOptions) -> AdapterResult<()> {
        validate_against_descriptor(&NMAP_DESCRIPTOR, options)?;

        if let Some(timing) = options.get("timing").and_then(serde_json::Value::as_i64)
            && !(0..=5).contains(&timing)
        {
            return Err(invalid_options("timing must be between 0 and 5"));
        }
        if let Some(top_ports) = options.get("top_ports").and_then(serde_json::Value::as_i64)
            && top_ports <= 0
        {
            return Err(invalid_options("top_ports must be positive"));
        }
        if let Some(ports) = options.get("ports").and_then(serde_json::Value::as_str)
            && !is_valid_port_list(ports)
        {
            return Err(invalid_options(
                "ports must contain only digits, commas and ranges",
            ));
        }
        if options.contains_key("ports") && options.contains_key("top_ports") {
            return Err(invalid_options("ports and top_ports are mutually exclusive"));
        }
        Ok(())
    }

    fn execute(&self, request: AdapterRequest) -> AdapterResult<ToolResult> {
        let raw = self.source.scan(&request)?;
        let findings = parse_nmap_grepable(&raw)?;
        Ok(ToolResult::completed(NMAP_DESCRIPTOR.name, raw, findings))
    }
}

pub fn nmap_scan_request(request: &AdapterRequest) -> ProcessSpawnRequest {
    let mut command = CommandSpec::new(NMAP_COMMAND).args(["-oG", "-"]);

    if let Some(ports) = request.string_option("ports") {
        command = command.args(["-p", ports]);
    } else if let Some(top_ports) = request.integer_option("top_ports") {
        command = command.arg("--top-ports").arg(top_ports.to_string());
    }
    if request.bool_option("service_detection") {
        command = command.arg("-sV");
    }
    if let Some(timing) = request.integer_option("timing") {
        command = command.arg(format!("-T{timing}"));
    }
    command = command.args(request.string_list_option("extra_args"));
    command = command.args(request.target_or("target").split_whitespace());

    request.spawn_request(NMAP_DESCRIPTOR.name, command)
}

fn is_valid_port_list(ports: &str) -> bool {
    !ports.trim().is_empty()
        && ports
            .chars()
            .all(|c| c.is_ascii_digit() || c == ',' || c == '-' || c.is_ascii_whitespace())
}

#[derive(Clone, Debug, Eq, PartialEq)]
struct PortEntry {
    port: u16,
    state: String,
    protocol: String,
    service: String,
    version: String,
}

fn parse_nmap_grepable(output: &str) -> AdapterResult<Vec<Finding>> {
    let mut findings = Vec::new();
    let mut saw_host = false;

    for line in output.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some(rest) = line.strip_prefix("Host:") else {
            continue;
        };
        saw_host = true;

        let mut sections = rest.split('\t');
        let host_field = sections.next().unwrap_or_default().trim();
        let address = host_field
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_string();
        if address.is_empty() {
            return Err(parse_error(format!("host line without address: '{line}'")));
        }

        for section in sections {
            let Some(ports) = section.trim().strip_prefix("Ports:") else {
                continue;
            };
            for entry in split_port_entries(ports) {
                let entry = parse_port_entry(&entry)?;
                if entry.state != "open" {
                    continue;
                }
                findings.push(open_port_finding(&address, &entry));
            }
        }
    }

    if !saw_host && !output.contains("Nmap done") {
        return Err(parse_error(
            "nmap output contained no host records or completion line".to_string(),
        ));
    }

    Ok(findings)
}

// Version strings may contain ", ", so only split where the next entry starts with a port number.
fn split_port_entries(ports: &str) -> Vec<String> {
    let mut entries: Vec<String> = Vec::new();
    for piece in ports.split(", ") {
        let starts_entry = piece
            .trim()
            .split('/')
            .next()
            .is_some_and(|port| !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()));
        match entries.last_mut() {
            Some(last) if !starts_entry => {
                last.push_str(", ");
                last.push_str(piece);
            }
            _ => entries.push(piece.trim().to_string()),
        }
    }
    entries
}

fn parse_port_entry(entry: &str) -> AdapterResult<PortEntry> {
    let fields: Vec<&str> = entry.split('/').collect();
    if fields.len() < 5 {
        return Err(parse_error(format!("malformed port entry '{entry}'")));
    }
    let port = fields[0]
        .trim()
        .parse::<u16>()
        .map_err(|error| parse_error(format!("invalid port in '{entry}': {error}")))?;

    Ok(PortEntry {
        port,
        state: fields[1].trim().to_string(),
        protocol: fields[2].trim().to_string(),
        service: fields[4].trim().to_string(),
        version: fields
            .get(6)
            .map(|version| version.trim().replace('|', "/"))
            .unwrap_or_default(),
    })
}

fn open_port_finding(address: &str, entry: &PortEntry) -> Finding {
    let service = if entry.service.is_empty() {
        "unknown"
    } else {
        entry.service.as_str()
    };
    let severity = if CLEARTEXT_SERVICES.contains(&service) {
        Severity::Medium
    } else {
        Severity::Info
    };

    let mut finding = Finding::new(
        format!("Open port {}/{} ({service})", entry.port, entry.protocol),
        severity,
        format!("{address}:{}", entry.port),
    )
    .description(format!(
        "{service} is reachable on {address} port {}/{}",
        entry.port, entry.protocol
    ));
    if !entry.version.is_empty() {
        finding = finding.evidence(entry.version.clone());
    }
    finding
}

fn invalid_options(message: &str) -> CoreError {
    CoreError::new(CoreErrorKind::InvalidOptions, message).with_adapter(NMAP_DESCRIPTOR.name)
}

fn parse_error(message: String) -> CoreError {
    CoreError::new(CoreErrorKind::ParseFailure, message).with_adapter(NMAP_DESCRIPTOR.name)
}
