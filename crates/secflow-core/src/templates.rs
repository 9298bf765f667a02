use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::models::{AdapterOptions, CoreError, CoreErrorKind, NewTask, TaskId, TaskRecord};
use crate::orchestration::DependencyGraph;

pub const DEFAULT_TARGET_PLACEHOLDER: &str = "{target}";

pub type TemplateResult<T> = Result<T, CoreError>;

/// Per-blueprint option overrides, keyed by blueprint key.
pub type TemplateOverrides = BTreeMap<String, AdapterOptions>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskBlueprint {
    pub key: String,
    pub adapter: String,
    #[serde(default)]
    pub options: AdapterOptions,
    /// Indices of earlier or later blueprints in the same template.
    #[serde(default)]
    pub depends_on: Vec<usize>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowTemplate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_placeholder")]
    pub target_placeholder: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub tasks: Vec<TaskBlueprint>,
}

fn default_placeholder() -> String {
    DEFAULT_TARGET_PLACEHOLDER.to_string()
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct TemplateSummary {
    pub name: String,
    pub description: String,
    pub task_count: usize,
    pub adapters: Vec<String>,
    pub tags: Vec<String>,
}

impl WorkflowTemplate {
    pub fn validate(&self) -> TemplateResult<()> {
        if self.name.trim().is_empty() {
            return Err(template_error("", "template name must not be empty"));
        }
        if self.target_placeholder.is_empty() {
            return Err(template_error(&self.name, "target placeholder must not be empty"));
        }
        if self.tasks.is_empty() {
            return Err(template_error(&self.name, "template has no tasks"));
        }

        let mut keys = HashSet::new();
        for (index, blueprint) in self.tasks.iter().enumerate() {
            if blueprint.key.trim().is_empty() {
                return Err(template_error(
                    &self.name,
                    format!("task #{index} has an empty key"),
                ));
            }
            if !keys.insert(blueprint.key.as_str()) {
                return Err(template_error(
                    &self.name,
                    format!("duplicate task key '{}'", blueprint.key),
                ));
            }
            if blueprint.adapter.trim().is_empty() {
                return Err(template_error(
                    &self.name,
                    format!("task '{}' names no adapter", blueprint.key),
                ));
            }
            if let Some(bad) = blueprint
                .depends_on
                .iter()
                .find(|&&dependency| dependency >= self.tasks.len())
            {
                return Err(template_error(
                    &self.name,
                    format!(
                        "task '{}' depends on index {bad}, but the template has {} tasks",
                        blueprint.key,
                        self.tasks.len()
                    ),
                ));
            }
        }

        let records: Vec<TaskRecord> = self
            .tasks
            .iter()
            .map(|blueprint| {
                TaskRecord::pending(
                    TaskId::new(blueprint.key.clone()),
                    blueprint.adapter.clone(),
                    AdapterOptions::new(),
                    self.dependency_ids(blueprint).collect(),
                )
            })
            .collect();
        DependencyGraph::validated(&records).map_err(|error| {
            CoreError::new(error.kind, format!("template '{}': {}", self.name, error.message))
        })?;

        Ok(())
    }

    fn dependency_ids<'a>(
        &'a self,
        blueprint: &'a TaskBlueprint,
    ) -> impl Iterator<Item = TaskId> + 'a {
        blueprint
            .depends_on
            .iter()
            .map(|&index| TaskId::new(self.tasks[index].key.clone()))
    }

    /// Resolves the template into concrete task inputs for `target`.
    ///
    /// Overrides are merged key by key over each blueprint's defaults, then the
    /// target placeholder is substituted into every string value.
    pub fn plan(&self, target: &str, overrides: &TemplateOverrides) -> TemplateResult<Vec<NewTask>> {
        self.validate()?;
        if target.trim().is_empty() {
            return Err(template_error(&self.name, "target must not be empty"));
        }
        if let Some(unknown) = overrides
            .keys()
            .find(|key| !self.tasks.iter().any(|blueprint| &blueprint.key == *key))
        {
            return Err(template_error(
                &self.name,
                format!("override names unknown task '{unknown}'"),
            ));
        }

        let target = target.trim();
        Ok(self
            .tasks
            .iter()
            .map(|blueprint| {
                let mut options = blueprint.options.clone();
                if let Some(extra) = overrides.get(&blueprint.key) {
                    options.extend(extra.clone());
                }
                for value in options.values_mut() {
                    substitute(value, &self.target_placeholder, target);
                }

                NewTask {
                    id: Some(TaskId::new(blueprint.key.clone())),
                    adapter: blueprint.adapter.clone(),
                    options,
                    depends_on: self.dependency_ids(blueprint).collect(),
                }
            })
            .collect())
    }

    /// Tags applied to workflows created from this template.
    pub fn workflow_tags(&self) -> BTreeSet<String> {
        self.tags
            .iter()
            .cloned()
            .chain(std::iter::once(format!("template:{}", self.name)))
            .collect()
    }

    pub fn summary(&self) -> TemplateSummary {
        let mut adapters: Vec<String> = Vec::new();
        for blueprint in &self.tasks {
            if !adapters.contains(&blueprint.adapter) {
                adapters.push(blueprint.adapter.clone());
            }
        }
        TemplateSummary {
            name: self.name.clone(),
            description: self.description.clone(),
            task_count: self.tasks.len(),
            adapters,
            tags: self.tags.clone(),
        }
    }
}

fn substitute(value: &mut serde_json::Value, placeholder: &str, target: &str) {
    match value {
        serde_json::Value::String(text) if text.contains(placeholder) => {
            *text = text.replace(placeholder, target);
        }
        serde_json::Value::Array(items) => {
            for item in items {
                substitute(item, placeholder, target);
            }
        }
        _ => {}
    }
}

/// Named workflow templates. Stateless apart from the template definitions.
#[derive(Clone, Debug, Default)]
pub struct TemplateLibrary {
    templates: BTreeMap<String, WorkflowTemplate>,
}

impl TemplateLibrary {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let templates = builtin_templates()
            .into_iter()
            .map(|template| (template.name.clone(), template))
            .collect();
        Self { templates }
    }

    pub fn register(&mut self, template: WorkflowTemplate) -> TemplateResult<()> {
        template.validate()?;
        if self.templates.contains_key(&template.name) {
            return Err(CoreError::new(
                CoreErrorKind::AlreadyRegistered,
                format!("a template named '{}' already exists", template.name),
            ));
        }
        self.templates.insert(template.name.clone(), template);
        Ok(())
    }

    /// Adds every template from a JSON array. Nothing is added if any entry is
    /// invalid.
    pub fn load_json_str(&mut self, raw: &str) -> TemplateResult<usize> {
        let templates: Vec<WorkflowTemplate> = serde_json::from_str(raw).map_err(|error| {
            CoreError::new(
                CoreErrorKind::InvalidInput,
                format!("invalid template JSON: {error}"),
            )
        })?;

        let mut staged = self.clone();
        for template in templates.iter().cloned() {
            staged.register(template)?;
        }
        *self = staged;
        Ok(templates.len())
    }

    pub fn load_json_file(&mut self, path: &Path) -> TemplateResult<usize> {
        let raw = std::fs::read_to_string(path).map_err(|error| {
            CoreError::new(
                CoreErrorKind::InvalidInput,
                format!("failed to read templates '{}': {error}", path.display()),
            )
        })?;
        let loaded = self.load_json_str(&raw)?;
        tracing::debug!(path = %path.display(), loaded, "loaded workflow templates");
        Ok(loaded)
    }

    pub fn get(&self, name: &str) -> TemplateResult<&WorkflowTemplate> {
        self.templates.get(name).ok_or_else(|| {
            CoreError::new(
                CoreErrorKind::NotFound,
                format!("no template is named '{name}'"),
            )
        })
    }

    pub fn summaries(&self) -> Vec<TemplateSummary> {
        self.templates.values().map(WorkflowTemplate::summary).collect()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

fn template_error(template: &str, message: impl AsRef<str>) -> CoreError {
    let message = message.as_ref();
    let message = if template.is_empty() {
        message.to_string()
    } else {
        format!("template '{template}': {message}")
    };
    CoreError::new(CoreErrorKind::InvalidInput, message)
}

fn blueprint(
    key: &str,
    adapter: &str,
    options: serde_json::Value,
    depends_on: &[usize],
) -> TaskBlueprint {
    let options = match options {
        serde_json::Value::Object(map) => map.into_iter().collect(),
        _ => AdapterOptions::new(),
    };
    TaskBlueprint {
        key: key.to_string(),
        adapter: adapter.to_string(),
        options,
        depends_on: depends_on.to_vec(),
    }
}

fn template(
    name: &str,
    description: &str,
    tags: &[&str],
    tasks: Vec<TaskBlueprint>,
) -> WorkflowTemplate {
    WorkflowTemplate {
        name: name.to_string(),
        description: description.to_string(),
        target_placeholder: default_placeholder(),
        tags: tags.iter().map(|tag| tag.to_string()).collect(),
        tasks,
    }
}

fn builtin_templates() -> Vec<WorkflowTemplate> {
    use serde_json::json;

    vec![
        template(
            "web_application_scan",
            "Port check, then web server, template and proxy scans; SQL injection testing follows the proxy crawl",
            &["web"],
            vec![
                blueprint(
                    "ports",
                    "nmap",
                    json!({"target": "{target}", "ports": "80,443,8080,8443", "service_detection": true}),
                    &[],
                ),
                blueprint("nikto", "nikto", json!({"host": "{target}"}), &[0]),
                blueprint(
                    "nuclei",
                    "nuclei",
                    json!({"url": "https://{target}", "severity": ["critical", "high", "medium"]}),
                    &[0],
                ),
                blueprint(
                    "zap",
                    "zap",
                    json!({"url": "https://{target}", "active_scan": false}),
                    &[0],
                ),
                blueprint(
                    "sqlmap",
                    "sqlmap",
                    json!({"url": "https://{target}", "level": 1, "risk": 1}),
                    &[3],
                ),
            ],
        ),
        template(
            "network_discovery",
            "Fast sweep of common ports followed by service fingerprinting",
            &["network"],
            vec![
                blueprint(
                    "sweep",
                    "nmap",
                    json!({"target": "{target}", "top_ports": 1000, "timing": 4}),
                    &[],
                ),
                blueprint(
                    "services",
                    "nmap",
                    json!({"target": "{target}", "top_ports": 1000, "service_detection": true}),
                    &[0],
                ),
            ],
        ),
        template(
            "container_audit",
            "Vulnerability scan of a container image",
            &["container"],
            vec![blueprint(
                "image",
                "trivy",
                json!({"image": "{target}", "severity": ["critical", "high", "medium", "low"]}),
                &[],
            )],
        ),
        template(
            "full_assessment",
            "Network discovery feeding every web-facing scanner, with an active proxy scan",
            &["network", "web"],
            vec![
                blueprint(
                    "discovery",
                    "nmap",
                    json!({"target": "{target}", "top_ports": 1000, "service_detection": true}),
                    &[],
                ),
                blueprint("nikto", "nikto", json!({"host": "{target}"}), &[0]),
                blueprint("nuclei", "nuclei", json!({"url": "https://{target}"}), &[0]),
                blueprint(
                    "zap",
                    "zap",
                    json!({"url": "https://{target}", "active_scan": true}),
                    &[0],
                ),
                blueprint(
                    "sqlmap",
                    "sqlmap",
                    json!({"url": "https://{target}", "level": 2, "risk": 1}),
                    &[3],
                ),
            ],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use crate::models::{CoreErrorKind, TaskId};

    use super::{TemplateLibrary, TemplateOverrides, WorkflowTemplate, blueprint, template};

    #[test]
    fn builtin_templates_validate() {
        let library = TemplateLibrary::builtin();
        let names: Vec<String> = library.summaries().into_iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            vec![
                "container_audit",
                "full_assessment",
                "network_discovery",
                "web_application_scan"
            ]
        );
        for summary in library.summaries() {
            library.get(&summary.name).unwrap().validate().unwrap();
        }
    }

    #[test]
    fn plan_substitutes_target_and_merges_overrides() {
        let library = TemplateLibrary::builtin();
        let template = library.get("web_application_scan").unwrap();
        let overrides: TemplateOverrides = serde_json::from_value(serde_json::json!({
            "sqlmap": {"level": 3, "data": "q={target}"},
            "ports": {"ports": "443"}
        }))
        .unwrap();

        let tasks = template.plan("shop.example.com", &overrides).unwrap();
        let sqlmap = tasks.iter().find(|task| task.adapter == "sqlmap").unwrap();
        assert_eq!(sqlmap.id, Some(TaskId::from("sqlmap")));
        assert_eq!(sqlmap.options["url"], "https://shop.example.com");
        assert_eq!(sqlmap.options["level"], 3);
        assert_eq!(sqlmap.options["risk"], 1);
        assert_eq!(sqlmap.options["data"], "q=shop.example.com");
        assert_eq!(sqlmap.depends_on, vec![TaskId::from("zap")]);

        let ports = &tasks[0];
        assert_eq!(ports.options["ports"], "443");
        assert_eq!(ports.options["target"], "shop.example.com");
    }

    #[test]
    fn override_for_unknown_key_is_rejected() {
        let library = TemplateLibrary::builtin();
        let overrides: TemplateOverrides =
            serde_json::from_value(serde_json::json!({"ghost": {"level": 2}})).unwrap();
        let error = library
            .get("network_discovery")
            .unwrap()
            .plan("10.0.0.0/24", &overrides)
            .unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::InvalidInput);
        assert!(error.message.contains("ghost"));
    }

    #[test]
    fn out_of_range_and_cyclic_dependencies_are_invalid() {
        let out_of_range = template(
            "broken",
            "",
            &[],
            vec![blueprint("a", "nmap", serde_json::json!({}), &[4])],
        );
        assert_eq!(out_of_range.validate().unwrap_err().kind, CoreErrorKind::InvalidInput);

        let cyclic = template(
            "loop",
            "",
            &[],
            vec![
                blueprint("a", "nmap", serde_json::json!({}), &[1]),
                blueprint("b", "nmap", serde_json::json!({}), &[0]),
            ],
        );
        assert_eq!(cyclic.validate().unwrap_err().kind, CoreErrorKind::CyclicDependency);
    }

    #[test]
    fn json_load_is_all_or_nothing() {
        let mut library = TemplateLibrary::empty();
        let raw = r#"[
            {"name": "quick", "tasks": [{"key": "scan", "adapter": "nmap", "options": {"target": "{target}"}}]},
            {"name": "quick", "tasks": [{"key": "scan", "adapter": "nmap"}]}
        ]"#;
        assert_eq!(
            library.load_json_str(raw).unwrap_err().kind,
            CoreErrorKind::AlreadyRegistered
        );
        assert!(library.is_empty());

        let loaded = library
            .load_json_str(r#"[{"name": "quick", "tags": ["fast"], "tasks": [{"key": "scan", "adapter": "nmap"}]}]"#)
            .unwrap();
        assert_eq!(loaded, 1);
        let quick: &WorkflowTemplate = library.get("quick").unwrap();
        assert_eq!(quick.target_placeholder, "{target}");
        assert!(quick.workflow_tags().contains("template:quick"));
        assert!(quick.workflow_tags().contains("fast"));
    }
}
