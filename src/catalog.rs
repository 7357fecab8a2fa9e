use std::collections::HashMap;

use data_model::{FrameworkInfo, RuntimeInfo};
use serde_json::Value;

use crate::config::CatalogConfig;

/// Runtimes and frameworks known to the platform. Built once at start up and
/// shared read-only.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    runtimes: HashMap<String, RuntimeInfo>,
    frameworks: HashMap<String, FrameworkInfo>,
}

impl Catalog {
    pub fn new(config: &CatalogConfig) -> Self {
        let runtimes = config
            .runtimes
            .iter()
            .filter(|(_, runtime)| !runtime.disabled)
            .map(|(name, runtime)| {
                let mut runtime = runtime.clone();
                runtime.name = name.clone();
                (name.clone(), runtime)
            })
            .collect();
        let frameworks = config
            .frameworks
            .iter()
            .filter(|(_, framework)| !framework.disabled)
            .map(|(name, framework)| {
                let mut framework = framework.clone();
                framework.name = name.clone();
                (name.clone(), framework)
            })
            .collect();
        Self {
            runtimes,
            frameworks,
        }
    }

    pub fn runtime(&self, name: &str) -> Option<&RuntimeInfo> {
        self.runtimes.get(name)
    }

    pub fn framework(&self, name: &str) -> Option<&FrameworkInfo> {
        self.frameworks.get(name)
    }

    /// The `runtime_info` object sent to hosts; empty for unknown runtimes.
    pub fn runtime_info(&self, name: &str) -> Value {
        self.runtime(name)
            .and_then(|runtime| serde_json::to_value(runtime).ok())
            .unwrap_or_else(|| Value::Object(Default::default()))
    }

    /// Whether `framework` may run on `runtime`. Unknown frameworks place no
    /// restriction.
    pub fn supports(&self, framework: &str, runtime: &str) -> bool {
        self.framework(framework)
            .map_or(true, |framework| framework.supports_runtime(runtime))
    }

    pub fn counts(&self) -> (usize, usize) {
        (self.runtimes.len(), self.frameworks.len())
    }
}
