use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::adapters::tool::{AdapterRequest, AdapterResult, ToolAdapter, validate_against_descriptor};
use crate::models::{
    AdapterDescriptor, AdapterOptions, CoreError, CoreErrorKind, Finding, OptionKind, OptionSpec,
    Severity, ToolCategory, ToolResult,
};

const ZAP_OPTIONS: &[OptionSpec] = &[
    OptionSpec::optional("url", OptionKind::String, "start URL; defaults to the workflow target"),
    OptionSpec::optional("active_scan", OptionKind::Boolean, "run an active scan after spidering"),
    OptionSpec::optional("max_children", OptionKind::Integer, "limit spider breadth per node"),
];

pub const ZAP_DESCRIPTOR: AdapterDescriptor = AdapterDescriptor {
    name: "zap",
    display_name: "OWASP ZAP",
    category: ToolCategory::WebProxy,
    options: ZAP_OPTIONS,
    default_timeout: Some(Duration::from_secs(3600)),
    functional: true,
};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ZapScan {
    Spider,
    Active,
}

impl ZapScan {
    pub fn api_component(self) -> &'static str {
        match self {
            Self::Spider => "spider",
            Self::Active => "ascan",
        }
    }
}

/// The subset of the ZAP API a scan needs.
pub trait ZapSource: Send + Sync {
    fn start_scan(&self, scan: ZapScan, url: &str, max_children: Option<i64>)
    -> AdapterResult<String>;
    fn scan_progress(&self, scan: ZapScan, scan_id: &str) -> AdapterResult<u8>;
    fn stop_scan(&self, scan: ZapScan, scan_id: &str) -> AdapterResult<()>;
    fn passive_records_remaining(&self) -> AdapterResult<u64>;
    fn alerts(&self, base_url: &str) -> AdapterResult<String>;
}

pub struct ZapAdapter<S: ZapSource> {
    source: S,
    poll_interval: Duration,
}

impl<S: ZapSource> ZapAdapter<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn run_scan(
        &self,
        scan: ZapScan,
        url: &str,
        request: &AdapterRequest,
        deadline: Instant,
    ) -> AdapterResult<()> {
        let scan_id = self
            .source
            .start_scan(scan, url, request.integer_option("max_children"))?;
        tracing::debug!(
            workflow_id = request.workflow.0,
            task_id = %request.task,
            scan = scan.api_component(),
            scan_id = %scan_id,
            "started zap scan"
        );

        loop {
            if let Err(error) = self.check_interrupted(request, deadline) {
                if let Err(stop_error) = self.source.stop_scan(scan, &scan_id) {
                    tracing::warn!(
                        scan = scan.api_component(),
                        scan_id = %scan_id,
                        message = %stop_error.message,
                        "failed to stop zap scan"
                    );
                }
                return Err(error);
            }
            if self.source.scan_progress(scan, &scan_id)? >= 100 {
                return Ok(());
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    fn drain_passive_queue(&self, request: &AdapterRequest, deadline: Instant) -> AdapterResult<()> {
        loop {
            self.check_interrupted(request, deadline)?;
            if self.source.passive_records_remaining()? == 0 {
                return Ok(());
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    fn check_interrupted(&self, request: &AdapterRequest, deadline: Instant) -> AdapterResult<()> {
        request.ensure_not_cancelled(ZAP_DESCRIPTOR.name)?;
        if Instant::now() >= deadline {
            return Err(CoreError::new(
                CoreErrorKind::Timeout,
                format!("zap scan exceeded {}s", request.timeout.as_secs()),
            )
            .with_adapter(ZAP_DESCRIPTOR.name));
        }
        Ok(())
    }
}

impl<S: ZapSource> ToolAdapter for ZapAdapter<S> {
    fn descriptor(&self) -> &AdapterDescriptor {
        &ZAP_DESCRIPTOR
    }

    fn validate_options(&self, options: &AdapterOptions) -> AdapterResult<()> {
        validate_against_descriptor(&ZAP_DESCRIPTOR, options)?;
        if let Some(url) = options.get("url").and_then(serde_json::Value::as_str)
            && !(url.starts_with("http://") || url.starts_with("https://"))
        {
            return Err(CoreError::new(
                CoreErrorKind::InvalidOptions,
                format!("url '{url}' must start with http:// or https://"),
            )
            .with_adapter(ZAP_DESCRIPTOR.name));
        }
        Ok(())
    }

    fn execute(&self, request: AdapterRequest) -> AdapterResult<ToolResult> {
        let deadline = Instant::now() + request.timeout;
        let url = zap_start_url(request.target_or("url"));

        self.run_scan(ZapScan::Spider, &url, &request, deadline)?;
        if request.bool_option("active_scan") {
            self.run_scan(ZapScan::Active, &url, &request, deadline)?;
        }
        self.drain_passive_queue(&request, deadline)?;

        let raw = self.source.alerts(&url)?;
        let findings = parse_zap_alerts(&raw)?;
        Ok(ToolResult::completed(ZAP_DESCRIPTOR.name, raw, findings))
    }
}

fn zap_start_url(target: &str) -> String {
    if target.starts_with("http://") || target.starts_with("https://") {
        target.to_string()
    } else {
        format!("http://{target}")
    }
}

#[derive(Debug, Deserialize)]
struct ZapAlerts {
    #[serde(default)]
    alerts: Vec<ZapAlert>,
}

#[derive(Debug, Deserialize)]
struct ZapAlert {
    alert: Option<String>,
    name: Option<String>,
    risk: Option<String>,
    url: Option<String>,
    #[serde(default)]
    param: String,
    #[serde(default)]
    evidence: String,
    #[serde(default)]
    description: String,
}

fn parse_zap_alerts(output: &str) -> AdapterResult<Vec<Finding>> {
    let parsed: ZapAlerts = serde_json::from_str(output).map_err(|error| {
        CoreError::new(
            CoreErrorKind::ParseFailure,
            format!("invalid zap alerts JSON: {error}"),
        )
        .with_adapter(ZAP_DESCRIPTOR.name)
    })?;

    Ok(parsed
        .alerts
        .into_iter()
        .map(|alert| {
            let title = alert
                .alert
                .or(alert.name)
                .unwrap_or_else(|| "Unnamed ZAP alert".to_string());
            let severity = alert
                .risk
                .as_deref()
                .and_then(Severity::from_label)
                .unwrap_or(Severity::Info);
            let url = alert.url.unwrap_or_default();
            let location = if alert.param.is_empty() {
                url
            } else {
                format!("{url} [{}]", alert.param)
            };
            Finding::new(title, severity, location)
                .description(alert.description.trim())
                .evidence(alert.evidence)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::adapters::tool::{AdapterRequest, AdapterResult, ToolAdapter};
    use crate::models::{AdapterOptions, CoreErrorKind, Severity, TaskId, WorkflowId};
    use crate::orchestration::TaskCancellationToken;

    use super::{ZapAdapter, ZapScan, ZapSource, parse_zap_alerts};

    const ALERTS_FIXTURE: &str = include_str!("../../tests/fixtures/zap/alerts.json");

    #[derive(Default)]
    struct ScriptedZap {
        calls: Mutex<Vec<String>>,
        progress_steps: Mutex<Vec<u8>>,
        never_finishes: bool,
    }

    impl ScriptedZap {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ZapSource for &ScriptedZap {
        fn start_scan(
            &self,
            scan: ZapScan,
            url: &str,
            _max_children: Option<i64>,
        ) -> AdapterResult<String> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("start {} {url}", scan.api_component()));
            Ok("3".to_string())
        }

        fn scan_progress(&self, _scan: ZapScan, _scan_id: &str) -> AdapterResult<u8> {
            if self.never_finishes {
                return Ok(10);
            }
            let mut steps = self.progress_steps.lock().unwrap();
            Ok(if steps.is_empty() { 100 } else { steps.remove(0) })
        }

        fn stop_scan(&self, scan: ZapScan, scan_id: &str) -> AdapterResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("stop {} {scan_id}", scan.api_component()));
            Ok(())
        }

        fn passive_records_remaining(&self) -> AdapterResult<u64> {
            Ok(0)
        }

        fn alerts(&self, _base_url: &str) -> AdapterResult<String> {
            Ok(ALERTS_FIXTURE.to_string())
        }
    }

    fn request(options: serde_json::Value) -> AdapterRequest {
        let options: AdapterOptions = serde_json::from_value(options).unwrap();
        AdapterRequest::new(WorkflowId(5), TaskId::from("proxy"), "example.com").options(options)
    }

    #[test]
    fn parses_alerts_from_fixture() {
        let findings = parse_zap_alerts(ALERTS_FIXTURE).unwrap();
        assert_eq!(findings.len(), 3);
        assert_eq!(findings[0].title, "Cross Site Scripting (Reflected)");
        assert_eq!(findings[0].severity, Severity::High);
        assert_eq!(findings[0].location, "http://example.com/search?q=x [q]");
        assert_eq!(findings[1].severity, Severity::Medium);
        assert_eq!(findings[2].severity, Severity::Info);
        assert!(findings[2].evidence.is_none());
    }

    #[test]
    fn spider_then_active_scan_then_alerts() {
        let zap = ScriptedZap {
            progress_steps: Mutex::new(vec![20, 70]),
            ..ScriptedZap::default()
        };
        let adapter = ZapAdapter::new(&zap).with_poll_interval(Duration::from_millis(1));

        let result = adapter
            .execute(request(serde_json::json!({"active_scan": true})))
            .unwrap();

        assert_eq!(result.findings.len(), 3);
        assert_eq!(
            zap.calls(),
            vec!["start spider http://example.com", "start ascan http://example.com"]
        );
    }

    #[test]
    fn deadline_stops_scan_with_timeout() {
        let zap = ScriptedZap {
            never_finishes: true,
            ..ScriptedZap::default()
        };
        let adapter = ZapAdapter::new(&zap).with_poll_interval(Duration::from_millis(5));

        let error = adapter
            .execute(request(serde_json::json!({})).timeout(Duration::from_millis(30)))
            .unwrap_err();

        assert_eq!(error.kind, CoreErrorKind::Timeout);
        assert!(zap.calls().contains(&"stop spider 3".to_string()));
    }

    #[test]
    fn cancellation_stops_scan() {
        let zap = ScriptedZap {
            never_finishes: true,
            ..ScriptedZap::default()
        };
        let adapter = ZapAdapter::new(&zap).with_poll_interval(Duration::from_millis(1));
        let token = TaskCancellationToken::new();
        token.cancel();

        let error = adapter
            .execute(request(serde_json::json!({})).cancellation(token))
            .unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::Cancelled);
    }

    #[test]
    fn rejects_non_http_url_option() {
        let zap = ScriptedZap::default();
        let adapter = ZapAdapter::new(&zap);
        let options: AdapterOptions =
            serde_json::from_value(serde_json::json!({"url": "ftp://example.com"})).unwrap();
        assert_eq!(
            adapter.validate_options(&options).unwrap_err().kind,
            CoreErrorKind::InvalidOptions
        );
    }
}
