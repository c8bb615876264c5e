use anyhow::{bail, Result};
use rigger_core::EffectiveSpecification;
use serde::Serialize;
use tracing::{info, warn};

use crate::outcome::RunOptions;

/// An extension run on demand against a loaded specification.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Returns `Ok(false)` when the plugin ran but did not succeed.
    fn apply(&self, effective: &EffectiveSpecification, options: &RunOptions) -> Result<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginOutcome {
    pub name: String,
    pub success: bool,
    pub error: Option<String>,
}

/// Plugins in registration order. Names are unique.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Box<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        Self {
            plugins: vec![Box::new(InventoryPlugin)],
        }
    }

    pub fn register(&mut self, plugin: Box<dyn Plugin>) -> Result<()> {
        if self.get(plugin.name()).is_some() {
            bail!("plugin '{}' is already registered", plugin.name());
        }
        self.plugins.push(plugin);
        Ok(())
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|plugin| plugin.name()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&dyn Plugin> {
        self.plugins
            .iter()
            .find(|plugin| plugin.name() == name)
            .map(|plugin| plugin.as_ref())
    }

    /// Runs the named plugins, or every plugin when `names` is empty. Unknown
    /// names are rejected before anything runs; a failing plugin does not stop
    /// the ones after it.
    pub fn run(
        &self,
        names: &[String],
        effective: &EffectiveSpecification,
        options: &RunOptions,
    ) -> Result<Vec<PluginOutcome>> {
        let selected: Vec<&dyn Plugin> = if names.is_empty() {
            self.plugins.iter().map(|plugin| plugin.as_ref()).collect()
        } else {
            names
                .iter()
                .map(|name| match self.get(name) {
                    Some(plugin) => Ok(plugin),
                    None => bail!("plugin '{name}' not found"),
                })
                .collect::<Result<_>>()?
        };

        Ok(selected
            .into_iter()
            .map(|plugin| {
                let name = plugin.name().to_string();
                match plugin.apply(effective, options) {
                    Ok(success) => {
                        info!(plugin = %name, success, "plugin finished");
                        PluginOutcome {
                            name,
                            success,
                            error: None,
                        }
                    }
                    Err(err) => {
                        warn!(plugin = %name, error = %format!("{err:#}"), "plugin failed");
                        PluginOutcome {
                            name,
                            success: false,
                            error: Some(format!("{err:#}")),
                        }
                    }
                }
            })
            .collect())
    }
}

/// Logs how many items each section of the specification declares.
#[derive(Debug, Clone, Copy, Default)]
pub struct InventoryPlugin;

impl InventoryPlugin {
    pub fn summary(effective: &EffectiveSpecification) -> String {
        let spec = &effective.spec;
        format!(
            "{}: {} packages, {} repositories, {} dotfiles, {} scripts, {} hooks",
            effective.name(),
            spec.system.packages.len(),
            spec.git.repositories.len(),
            spec.dotfiles.len(),
            spec.scripts.len(),
            spec.hooks.iter().count()
        )
    }
}

impl Plugin for InventoryPlugin {
    fn name(&self) -> &str {
        "inventory"
    }

    fn description(&self) -> &str {
        "summarise the items declared by the specification"
    }

    fn apply(&self, effective: &EffectiveSpecification, options: &RunOptions) -> Result<bool> {
        let summary = Self::summary(effective);
        if options.verbose {
            for (point, hook) in effective.spec.hooks.iter() {
                info!(hook = point.as_str(), command = %hook.command, "declared hook");
            }
        }
        info!(summary = %summary, "inventory");
        Ok(true)
    }
}
