//! Template rendering for system, instance, and per-step messages.

use anyhow::{Context, Result};
use minijinja::{Environment, UndefinedBehavior};
use serde_json::{Map, Value};
use tracing::debug;

use crate::core::template_select::TemplateChoice;
use crate::io::config::AgentConfig;

/// Variables visible to a template render.
///
/// Later insertions overwrite earlier ones, so callers add the broadest scope first
/// (instance arguments, then system arguments, then environment state, then the
/// per-step values).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptVars {
    values: Map<String, Value>,
}

impl PromptVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    pub fn extend_json(&mut self, values: &Map<String, Value>) -> &mut Self {
        for (k, v) in values {
            self.values.insert(k.clone(), v.clone());
        }
        self
    }

    pub fn extend_strings<'a>(
        &mut self,
        values: impl IntoIterator<Item = (&'a String, &'a String)>,
    ) -> &mut Self {
        for (k, v) in values {
            self.values.insert(k.clone(), Value::String(v.clone()));
        }
        self
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.values
    }
}

/// Template engine wrapper around minijinja.
///
/// Undefined variables are errors: a template that names a value the loop does not
/// supply fails the run rather than rendering a degraded prompt.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);
        Self { env }
    }

    pub fn render(&self, label: &str, template: &str, vars: &PromptVars) -> Result<String> {
        let rendered = self
            .env
            .render_str(template, &vars.values)
            .with_context(|| format!("render {label} template"))?;
        debug!(template = label, bytes = rendered.len(), "rendered template");
        Ok(rendered)
    }

    /// Render the user turn for one iteration.
    pub fn render_turn(
        &self,
        config: &AgentConfig,
        choice: TemplateChoice,
        vars: &PromptVars,
    ) -> Result<String> {
        let mut templates: Vec<(&str, &str)> = Vec::with_capacity(2);
        match choice {
            TemplateChoice::Instance => {
                templates.push(("instance", &config.instance_template));
                if let Some(strategy) = &config.strategy_template {
                    templates.push(("strategy", strategy));
                }
            }
            TemplateChoice::NoOutput => {
                templates.push(("next_step_no_output", &config.next_step_no_output_template));
            }
            TemplateChoice::Codegraph => {
                templates.push(("next_step_codegraph", &config.next_step_codegraph_template));
            }
            TemplateChoice::NextStep => templates.push(("next_step", &config.next_step_template)),
        }
        let messages = templates
            .into_iter()
            .map(|(label, template)| self.render(label, template, vars))
            .collect::<Result<Vec<_>>>()?;
        Ok(messages.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> PromptVars {
        let mut vars = PromptVars::new();
        vars.set("issue", "fix the bug").set("observation", "ok");
        vars
    }

    #[test]
    fn instance_turn_appends_strategy() {
        let config = AgentConfig {
            instance_template: "Issue: {{ issue }}".to_string(),
            strategy_template: Some("Plan first.".to_string()),
            ..AgentConfig::default()
        };
        let rendered = PromptEngine::new()
            .render_turn(&config, TemplateChoice::Instance, &vars())
            .expect("render");
        assert_eq!(rendered, "Issue: fix the bug\nPlan first.");
    }

    #[test]
    fn undefined_variable_is_an_error() {
        let config = AgentConfig {
            next_step_template: "{{ observation }} in {{ working_dir }}".to_string(),
            ..AgentConfig::default()
        };
        let err = PromptEngine::new()
            .render_turn(&config, TemplateChoice::NextStep, &vars())
            .expect_err("strict");
        assert!(format!("{err:#}").contains("next_step"));
    }

    #[test]
    fn later_values_override_earlier_ones() {
        let mut vars = vars();
        let mut state = Map::new();
        state.insert("issue".to_string(), Value::from("from state"));
        vars.extend_json(&state);
        let rendered = PromptEngine::new()
            .render("t", "{{ issue }}", &vars)
            .expect("render");
        assert_eq!(rendered, "from state");
    }
}
