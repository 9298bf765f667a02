use crate::adapters::tool::{AdapterRequest, AdapterResult, ToolAdapter};
use crate::models::{AdapterDescriptor, CoreError, CoreErrorKind, ToolCategory, ToolResult};

/// Stand-in for a tool that cannot run on this host.
///
/// It validates options like the real adapter so workflows still plan, but every
/// execution fails with `NotInstalled`. It never produces findings.
#[derive(Clone, Debug)]
pub struct NullAdapter {
    descriptor: AdapterDescriptor,
    reason: String,
}

impl NullAdapter {
    pub fn standing_in_for(descriptor: &AdapterDescriptor, reason: impl Into<String>) -> Self {
        Self {
            descriptor: AdapterDescriptor {
                functional: false,
                ..descriptor.clone()
            },
            reason: reason.into(),
        }
    }

    pub fn named(name: &'static str, reason: impl Into<String>) -> Self {
        Self {
            descriptor: AdapterDescriptor {
                name,
                display_name: name,
                category: ToolCategory::Custom,
                options: &[],
                default_timeout: None,
                functional: false,
            },
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl ToolAdapter for NullAdapter {
    fn descriptor(&self) -> &AdapterDescriptor {
        &self.descriptor
    }

    fn execute(&self, request: AdapterRequest) -> AdapterResult<ToolResult> {
        Err(CoreError::new(
            CoreErrorKind::NotInstalled,
            format!("{} is unavailable: {}", self.descriptor.display_name, self.reason),
        )
        .with_adapter(self.descriptor.name)
        .with_workflow(request.workflow)
        .with_task(request.task))
    }
}

#[cfg(test)]
mod tests {
    use crate::adapters::nmap::NMAP_DESCRIPTOR;
    use crate::adapters::tool::{AdapterRequest, ToolAdapter};
    use crate::models::{CoreErrorKind, TaskId, WorkflowId};

    use super::NullAdapter;

    #[test]
    fn stand_in_keeps_options_but_is_not_functional() {
        let adapter = NullAdapter::standing_in_for(&NMAP_DESCRIPTOR, "nmap binary not found");
        assert_eq!(adapter.descriptor().name, "nmap");
        assert!(!adapter.descriptor().functional);
        assert_eq!(adapter.descriptor().options, NMAP_DESCRIPTOR.options);
    }

    #[test]
    fn execution_fails_not_installed() {
        let adapter = NullAdapter::named("ghost", "disabled in configuration");
        let error = adapter
            .execute(AdapterRequest::new(WorkflowId(1), TaskId::from("t"), "example.com"))
            .unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::NotInstalled);
        assert_eq!(error.adapter.as_deref(), Some("ghost"));
        assert!(error.message.contains("disabled in configuration"));
    }
}
