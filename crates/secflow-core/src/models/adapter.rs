use std::time::Duration;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ToolCategory {
    NetworkScanner,
    WebProxy,
    TemplateScanner,
    InjectionTester,
    WebServerScanner,
    ContainerScanner,
    Custom,
}

impl ToolCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NetworkScanner => "network_scanner",
            Self::WebProxy => "web_proxy",
            Self::TemplateScanner => "template_scanner",
            Self::InjectionTester => "injection_tester",
            Self::WebServerScanner => "web_server_scanner",
            Self::ContainerScanner => "container_scanner",
            Self::Custom => "custom",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum OptionKind {
    String,
    Integer,
    Boolean,
    StringList,
}

impl OptionKind {
    pub fn matches(self, value: &serde_json::Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::StringList => value
                .as_array()
                .is_some_and(|items| items.iter().all(serde_json::Value::is_string)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::StringList => "string list",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OptionSpec {
    pub name: &'static str,
    pub kind: OptionKind,
    pub required: bool,
    pub description: &'static str,
}

impl OptionSpec {
    pub const fn optional(name: &'static str, kind: OptionKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: false,
            description,
        }
    }

    pub const fn required(name: &'static str, kind: OptionKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: true,
            description,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AdapterDescriptor {
    pub name: &'static str,
    pub display_name: &'static str,
    pub category: ToolCategory,
    pub options: &'static [OptionSpec],
    pub default_timeout: Option<Duration>,
    /// False only for placeholder adapters that cannot run their tool.
    pub functional: bool,
}

impl AdapterDescriptor {
    pub fn option(&self, name: &str) -> Option<&OptionSpec> {
        self.options.iter().find(|spec| spec.name == name)
    }
}
