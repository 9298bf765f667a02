use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::adapters::detect_utils::which_executable;
use crate::adapters::nikto::NIKTO_COMMAND;
use crate::adapters::nmap::NMAP_COMMAND;
use crate::adapters::nuclei::NUCLEI_COMMAND;
use crate::adapters::sqlmap::SQLMAP_COMMAND;
use crate::adapters::trivy::TRIVY_COMMAND;
use crate::adapters::{
    HttpZapSource, NIKTO_DESCRIPTOR, NMAP_DESCRIPTOR, NUCLEI_DESCRIPTOR, NiktoAdapter,
    NmapAdapter, NucleiAdapter, NullAdapter, ProcessNiktoSource, ProcessNmapSource,
    ProcessNucleiSource, ProcessSqlmapSource, ProcessTrivySource, SQLMAP_DESCRIPTOR,
    SqlmapAdapter, TRIVY_DESCRIPTOR, ToolAdapter, TrivyAdapter, ZAP_DESCRIPTOR, ZapAdapter,
};
use crate::config::OrchestratorConfig;
use crate::execution::ProcessExecutor;
use crate::models::{AdapterDescriptor, CoreError, CoreErrorKind};

pub type RegistryResult<T> = Result<T, CoreError>;

type ProcessAdapterFactory = fn(Arc<dyn ProcessExecutor>, PathBuf) -> Arc<dyn ToolAdapter>;

const BUILTIN_ADAPTERS: [AdapterDescriptor; 6] = [
    NMAP_DESCRIPTOR,
    ZAP_DESCRIPTOR,
    NUCLEI_DESCRIPTOR,
    SQLMAP_DESCRIPTOR,
    NIKTO_DESCRIPTOR,
    TRIVY_DESCRIPTOR,
];

pub fn builtin_descriptors() -> &'static [AdapterDescriptor] {
    &BUILTIN_ADAPTERS
}

pub fn builtin_descriptor(name: &str) -> Option<&'static AdapterDescriptor> {
    BUILTIN_ADAPTERS
        .iter()
        .find(|descriptor| descriptor.name == name)
}

/// Collects adapters before the registry is frozen.
#[derive(Default)]
pub struct AdapterRegistryBuilder {
    adapters: BTreeMap<String, Arc<dyn ToolAdapter>>,
}

impl AdapterRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        adapter: Arc<dyn ToolAdapter>,
    ) -> RegistryResult<()> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                "adapter name must not be empty",
            ));
        }
        if adapter.descriptor().name != name {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                format!(
                    "adapter registered as '{name}' describes itself as '{}'",
                    adapter.descriptor().name
                ),
            )
            .with_adapter(name));
        }
        if self.adapters.contains_key(&name) {
            return Err(CoreError::new(
                CoreErrorKind::AlreadyRegistered,
                format!("an adapter named '{name}' is already registered"),
            )
            .with_adapter(name));
        }

        self.adapters.insert(name, adapter);
        Ok(())
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn ToolAdapter>) -> RegistryResult<Self> {
        let name = adapter.descriptor().name;
        self.register(name, adapter)?;
        Ok(self)
    }

    pub fn build(self) -> AdapterRegistry {
        AdapterRegistry {
            adapters: Arc::new(self.adapters),
        }
    }
}

/// Immutable name → adapter table shared by every workflow.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: Arc<BTreeMap<String, Arc<dyn ToolAdapter>>>,
}

impl AdapterRegistry {
    pub fn builder() -> AdapterRegistryBuilder {
        AdapterRegistryBuilder::new()
    }

    pub fn lookup(&self, name: &str) -> RegistryResult<Arc<dyn ToolAdapter>> {
        self.adapters.get(name).cloned().ok_or_else(|| {
            CoreError::new(
                CoreErrorKind::NotFound,
                format!("no adapter is registered as '{name}'"),
            )
            .with_adapter(name)
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.adapters.keys().map(String::as_str)
    }

    pub fn descriptors(&self) -> Vec<AdapterDescriptor> {
        self.adapters
            .values()
            .map(|adapter| adapter.descriptor().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Registers every bundled adapter, substituting a [`NullAdapter`] for tools
    /// that are disabled or whose binary cannot be found.
    pub fn builtin(
        config: &OrchestratorConfig,
        executor: Arc<dyn ProcessExecutor>,
    ) -> RegistryResult<Self> {
        let mut builder = AdapterRegistryBuilder::new();

        let process_tools: [(&AdapterDescriptor, &str, ProcessAdapterFactory); 5] = [
            (&NMAP_DESCRIPTOR, NMAP_COMMAND, |executor, binary| {
                Arc::new(NmapAdapter::new(ProcessNmapSource::new(executor, binary)))
            }),
            (&NUCLEI_DESCRIPTOR, NUCLEI_COMMAND, |executor, binary| {
                Arc::new(NucleiAdapter::new(ProcessNucleiSource::new(executor, binary)))
            }),
            (&SQLMAP_DESCRIPTOR, SQLMAP_COMMAND, |executor, binary| {
                Arc::new(SqlmapAdapter::new(ProcessSqlmapSource::new(executor, binary)))
            }),
            (&NIKTO_DESCRIPTOR, NIKTO_COMMAND, |executor, binary| {
                Arc::new(NiktoAdapter::new(ProcessNiktoSource::new(executor, binary)))
            }),
            (&TRIVY_DESCRIPTOR, TRIVY_COMMAND, |executor, binary| {
                Arc::new(TrivyAdapter::new(ProcessTrivySource::new(executor, binary)))
            }),
        ];
        for (descriptor, default_command, factory) in process_tools {
            let adapter = match locate_tool(config, descriptor, default_command) {
                Ok(binary) => {
                    tracing::debug!(
                        adapter = descriptor.name,
                        binary = %binary.display(),
                        "located tool binary"
                    );
                    factory(executor.clone(), binary)
                }
                Err(reason) => null_stand_in(descriptor, reason),
            };
            builder.register(descriptor.name, adapter)?;
        }

        let zap: Arc<dyn ToolAdapter> = if config.tool(ZAP_DESCRIPTOR.name).enabled {
            Arc::new(ZapAdapter::new(HttpZapSource::new(
                config.zap_api_url.clone(),
                config.zap_api_key.clone(),
            )))
        } else {
            null_stand_in(&ZAP_DESCRIPTOR, "disabled in configuration".to_string())
        };
        builder.register(ZAP_DESCRIPTOR.name, zap)?;

        Ok(builder.build())
    }
}

fn locate_tool(
    config: &OrchestratorConfig,
    descriptor: &AdapterDescriptor,
    default_command: &str,
) -> Result<PathBuf, String> {
    let tool = config.tool(descriptor.name);
    if !tool.enabled {
        return Err("disabled in configuration".to_string());
    }
    let binary = tool.binary.as_deref().unwrap_or(default_command);
    which_executable(binary, &[]).ok_or_else(|| format!("'{binary}' was not found"))
}

fn null_stand_in(descriptor: &AdapterDescriptor, reason: String) -> Arc<dyn ToolAdapter> {
    tracing::warn!(
        adapter = descriptor.name,
        reason = %reason,
        "tool unavailable; registering non-functional stand-in"
    );
    Arc::new(NullAdapter::standing_in_for(descriptor, reason))
}
