use std::collections::BTreeMap;

use anyhow::{Context, Result};
use minijinja::{Environment, UndefinedBehavior, Value};

/// Renders a dotfile template against the specification's variables.
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, template: &str, variables: &BTreeMap<String, serde_yaml::Value>)
        -> Result<String>;
}

/// Jinja-compatible rendering. Variables are exposed at the top level of the
/// template context and an undefined variable is an error.
#[derive(Debug, Clone, Copy, Default)]
pub struct MiniJinjaRenderer;

impl TemplateRenderer for MiniJinjaRenderer {
    fn render(
        &self,
        template: &str,
        variables: &BTreeMap<String, serde_yaml::Value>,
    ) -> Result<String> {
        let mut env = Environment::new();
        env.set_keep_trailing_newline(true);
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.add_template("dotfile", template)
            .context("failed to parse template")?;
        let compiled = env
            .get_template("dotfile")
            .context("failed to load template")?;
        compiled
            .render(Value::from_serialize(variables))
            .context("failed to render template")
    }
}
