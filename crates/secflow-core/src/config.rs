use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::{CoreError, CoreErrorKind};

pub const CONFIG_PATH_ENV: &str = "SECFLOW_CONFIG";
pub const MAX_PARALLEL_ENV: &str = "SECFLOW_MAX_PARALLEL";
pub const DATABASE_PATH_ENV: &str = "SECFLOW_DB";
pub const TASK_TIMEOUT_ENV: &str = "SECFLOW_TASK_TIMEOUT_SECS";
pub const DEFAULT_CONFIG_FILE: &str = "secflow.json";

pub type ConfigResult<T> = Result<T, CoreError>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorConfig {
    pub max_parallel_tasks: usize,
    pub task_timeout_secs: u64,
    pub cancel_grace_period_ms: u64,
    pub database_path: Option<PathBuf>,
    pub templates_path: Option<PathBuf>,
    pub tools: BTreeMap<String, ToolConfig>,
    pub zap_api_url: String,
    pub zap_api_key: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallel_tasks: 4,
            task_timeout_secs: 600,
            cancel_grace_period_ms: 5000,
            database_path: None,
            templates_path: None,
            tools: BTreeMap::new(),
            zap_api_url: "http://127.0.0.1:8080".to_string(),
            zap_api_key: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolConfig {
    pub enabled: bool,
    /// Binary name or path; the adapter's own command name when unset.
    pub binary: Option<String>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            binary: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn cancel_grace_period(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_period_ms)
    }

    pub fn tool(&self, name: &str) -> ToolConfig {
        self.tools.get(name).cloned().unwrap_or_default()
    }

    pub fn from_json_str(raw: &str) -> ConfigResult<Self> {
        let mut config: Self = serde_json::from_str(raw).map_err(|error| {
            config_error(format!("invalid configuration JSON: {error}"))
        })?;
        config.zap_api_key = config.zap_api_key.as_deref().map(expand_env_vars);
        config.zap_api_url = expand_env_vars(&config.zap_api_url);
        Ok(config)
    }

    pub fn load_from_path(path: &Path) -> ConfigResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|error| {
            config_error(format!(
                "failed to read configuration '{}': {error}",
                path.display()
            ))
        })?;
        Self::from_json_str(&raw)
    }

    /// Loads configuration from the first source present: `explicit`, then
    /// `SECFLOW_CONFIG`, then `./secflow.json`, then built-in defaults. Environment
    /// overrides are applied last and the result is validated.
    pub fn resolve(explicit: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match resolve_config_path(explicit)? {
            Some(path) => {
                tracing::debug!(path = %path.display(), "loading configuration");
                Self::load_from_path(&path)?
            }
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> ConfigResult<()> {
        if let Some(raw) = lookup(MAX_PARALLEL_ENV) {
            self.max_parallel_tasks = parse_env_number(MAX_PARALLEL_ENV, &raw)?;
        }
        if let Some(raw) = lookup(TASK_TIMEOUT_ENV) {
            self.task_timeout_secs = parse_env_number(TASK_TIMEOUT_ENV, &raw)?;
        }
        if let Some(raw) = lookup(DATABASE_PATH_ENV)
            && !raw.trim().is_empty()
        {
            self.database_path = Some(PathBuf::from(raw.trim()));
        }
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_parallel_tasks == 0 {
            return Err(config_error("max_parallel_tasks must be at least 1".to_string()));
        }
        if self.task_timeout_secs == 0 {
            return Err(config_error("task_timeout_secs must be at least 1".to_string()));
        }
        if self.zap_api_url.trim().is_empty() {
            return Err(config_error("zap_api_url must not be empty".to_string()));
        }
        for (name, tool) in &self.tools {
            if tool.binary.as_deref().is_some_and(|binary| binary.trim().is_empty()) {
                return Err(config_error(format!("tools.{name}.binary must not be empty")));
            }
        }
        Ok(())
    }
}

fn resolve_config_path(explicit: Option<&Path>) -> ConfigResult<Option<PathBuf>> {
    if let Some(path) = explicit {
        return Ok(Some(path.to_path_buf()));
    }

    if let Ok(path) = std::env::var(CONFIG_PATH_ENV)
        && !path.trim().is_empty()
    {
        let path = PathBuf::from(path);
        if !path.exists() {
            return Err(config_error(format!(
                "{CONFIG_PATH_ENV} points at missing file '{}'",
                path.display()
            )));
        }
        return Ok(Some(path));
    }

    let candidate = PathBuf::from(DEFAULT_CONFIG_FILE);
    Ok(candidate.exists().then_some(candidate))
}

fn parse_env_number<T: std::str::FromStr>(key: &str, raw: &str) -> ConfigResult<T> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| config_error(format!("{key} must be a non-negative integer, got '{raw}'")))
}

/// Expands `${NAME}` references; unknown variables are left as written.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            match std::env::var(&name) {
                Ok(value) => out.push_str(&value),
                Err(_) => {
                    out.push_str("${");
                    out.push_str(&name);
                    out.push('}');
                }
            }
        } else {
            out.push(ch);
        }
    }

    out
}

fn config_error(message: String) -> CoreError {
    CoreError::new(CoreErrorKind::InvalidInput, message)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::time::Duration;

    use super::{OrchestratorConfig, expand_env_vars};

    #[test]
    fn defaults_are_valid() {
        let config = OrchestratorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_parallel_tasks, 4);
        assert_eq!(config.task_timeout(), Duration::from_secs(600));
        assert_eq!(config.cancel_grace_period(), Duration::from_millis(5000));
        assert!(config.tool("nmap").enabled);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = OrchestratorConfig::from_json_str(
            r#"{"max_parallel_tasks": 2, "tools": {"zap": {"enabled": false}, "nmap": {"binary": "/opt/nmap/bin/nmap"}}}"#,
        )
        .unwrap();
        assert_eq!(config.max_parallel_tasks, 2);
        assert_eq!(config.task_timeout_secs, 600);
        assert!(!config.tool("zap").enabled);
        assert_eq!(config.tool("nmap").binary.as_deref(), Some("/opt/nmap/bin/nmap"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(OrchestratorConfig::from_json_str(r#"{"max_parallel": 2}"#).is_err());
    }

    #[test]
    fn env_overrides_apply_and_validate() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("SECFLOW_MAX_PARALLEL", "8"),
            ("SECFLOW_DB", "/tmp/secflow.sqlite3"),
        ]);
        let mut config = OrchestratorConfig::default();
        config
            .apply_env_overrides(|key| env.get(key).map(|value| value.to_string()))
            .unwrap();
        assert_eq!(config.max_parallel_tasks, 8);
        assert_eq!(
            config.database_path,
            Some(PathBuf::from("/tmp/secflow.sqlite3"))
        );

        let mut config = OrchestratorConfig::default();
        let error = config
            .apply_env_overrides(|key| (key == "SECFLOW_TASK_TIMEOUT_SECS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(error.message.contains("SECFLOW_TASK_TIMEOUT_SECS"));
    }

    #[test]
    fn zero_parallelism_is_invalid() {
        let config = OrchestratorConfig {
            max_parallel_tasks: 0,
            ..OrchestratorConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_env_references_are_kept() {
        assert_eq!(
            expand_env_vars("key-${SECFLOW_SURELY_UNSET_VARIABLE}"),
            "key-${SECFLOW_SURELY_UNSET_VARIABLE}"
        );
    }
}
