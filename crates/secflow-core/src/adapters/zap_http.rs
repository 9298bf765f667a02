use std::time::Duration;

use crate::adapters::tool::AdapterResult;
use crate::adapters::zap::{ZAP_DESCRIPTOR, ZapScan, ZapSource};
use crate::models::{CoreError, CoreErrorKind};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Talks to a running ZAP daemon over its JSON API.
pub struct HttpZapSource {
    agent: ureq::Agent,
    base_url: String,
    api_key: Option<String>,
}

impl HttpZapSource {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn get_json(&self, path: &str, query: &[(&str, &str)]) -> AdapterResult<serde_json::Value> {
        let url = format!("{}/JSON/{path}/", self.base_url);
        let mut request = self.agent.get(&url);
        for (key, value) in query {
            request = request.query(key, value);
        }
        if let Some(api_key) = &self.api_key {
            request = request.set("X-ZAP-API-Key", api_key);
        }

        let response = request.call().map_err(|error| match error {
            ureq::Error::Status(code, response) => {
                let body = response.into_string().unwrap_or_default();
                zap_error(
                    CoreErrorKind::ProcessFailure,
                    format!("zap API {path} returned HTTP {code}: {}", body.trim()),
                )
            }
            ureq::Error::Transport(transport) => zap_error(
                CoreErrorKind::ProcessFailure,
                format!("zap API unreachable at {}: {transport}", self.base_url),
            ),
        })?;

        let body = response.into_string().map_err(|error| {
            zap_error(
                CoreErrorKind::ProcessFailure,
                format!("failed to read zap API response: {error}"),
            )
        })?;
        serde_json::from_str(&body).map_err(|error| {
            zap_error(
                CoreErrorKind::ParseFailure,
                format!("zap API {path} returned invalid JSON: {error}"),
            )
        })
    }

    fn get_field(&self, path: &str, query: &[(&str, &str)], field: &str) -> AdapterResult<String> {
        let value = self.get_json(path, query)?;
        value
            .get(field)
            .and_then(|field| match field {
                serde_json::Value::String(text) => Some(text.clone()),
                serde_json::Value::Number(number) => Some(number.to_string()),
                _ => None,
            })
            .ok_or_else(|| {
                zap_error(
                    CoreErrorKind::ParseFailure,
                    format!("zap API {path} response lacks '{field}'"),
                )
            })
    }
}

impl ZapSource for HttpZapSource {
    fn start_scan(
        &self,
        scan: ZapScan,
        url: &str,
        max_children: Option<i64>,
    ) -> AdapterResult<String> {
        let path = format!("{}/action/scan", scan.api_component());
        let max_children = max_children.map(|value| value.to_string());
        let mut query = vec![("url", url), ("recurse", "true")];
        if let (ZapScan::Spider, Some(max_children)) = (scan, max_children.as_deref()) {
            query.push(("maxChildren", max_children));
        }
        self.get_field(&path, &query, "scan")
    }

    fn scan_progress(&self, scan: ZapScan, scan_id: &str) -> AdapterResult<u8> {
        let path = format!("{}/view/status", scan.api_component());
        let status = self.get_field(&path, &[("scanId", scan_id)], "status")?;
        status.trim().parse::<u8>().map_err(|error| {
            zap_error(
                CoreErrorKind::ParseFailure,
                format!("invalid zap scan progress '{status}': {error}"),
            )
        })
    }

    fn stop_scan(&self, scan: ZapScan, scan_id: &str) -> AdapterResult<()> {
        let path = format!("{}/action/stop", scan.api_component());
        self.get_json(&path, &[("scanId", scan_id)]).map(|_| ())
    }

    fn passive_records_remaining(&self) -> AdapterResult<u64> {
        let remaining = self.get_field("pscan/view/recordsToScan", &[], "recordsToScan")?;
        remaining.trim().parse::<u64>().map_err(|error| {
            zap_error(
                CoreErrorKind::ParseFailure,
                format!("invalid zap passive queue size '{remaining}': {error}"),
            )
        })
    }

    fn alerts(&self, base_url: &str) -> AdapterResult<String> {
        let value = self.get_json("core/view/alerts", &[("baseurl", base_url)])?;
        Ok(value.to_string())
    }
}

fn zap_error(kind: CoreErrorKind, message: String) -> CoreError {
    CoreError::new(kind, message).with_adapter(ZAP_DESCRIPTOR.name)
}
