//! Prompt rendering for agent invocations.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::types::{ActionType, Directive};

const DIRECTIVE_TEMPLATE: &str = include_str!("prompts/directive.md");

/// Gate preview entry. Only auto shell gates are listed.
#[derive(Debug, Clone, Serialize)]
struct GatePreview<'a> {
    name: &'a str,
    command: &'a str,
    max_retries: Option<u32>,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("directive.md", DIRECTIVE_TEMPLATE)
            .context("load directive template")?;
        Ok(Self { env })
    }

    /// Render the single prompt message for `directive`.
    ///
    /// `bin` is the state machine binary the agent is told to call.
    pub fn render(&self, directive: &Directive, bin: &str) -> Result<String> {
        let gates: Vec<GatePreview<'_>> = directive
            .auto_shell_gates()
            .map(|gate| GatePreview {
                name: &gate.name,
                command: gate.command.as_deref().unwrap_or_default(),
                max_retries: gate.max_retries,
            })
            .collect();
        let template = self.env.get_template("directive.md")?;
        let rendered = template
            .render(context! {
                feature => &directive.feature,
                title => (!directive.title.trim().is_empty()).then(|| directive.title.trim()),
                action => directive.action.as_str(),
                phase => &directive.current_phase,
                task_id => &directive.task_id,
                output_path => &directive.output_path,
                message => directive.message.trim(),
                gates => gates,
                bin => bin,
                completion => completion_step(directive, bin),
            })
            .with_context(|| format!("render prompt for {}", directive.feature))?;
        debug!(feature = %directive.feature, bytes = rendered.len(), "rendered prompt");
        Ok(rendered)
    }
}

/// Closing instruction telling the agent how to record its work.
fn completion_step(directive: &Directive, bin: &str) -> String {
    let feature = &directive.feature;
    if let Some(command) = &directive.next_command {
        return format!("`{command}`");
    }
    if let Some(task) = &directive.task_id {
        return format!("`{bin} task complete {feature} {task}`");
    }
    match (directive.action, directive.action.artifact()) {
        (ActionType::ReviewCode, Some(artifact)) => format!(
            "`{bin} artifact approve {feature} {artifact}` (or `{bin} artifact reject {feature} {artifact} --reason <why>`)"
        ),
        (_, Some(artifact)) => format!("`{bin} artifact draft {feature} {artifact}`"),
        (_, None) => format!("run the `{bin}` command that records this step as complete"),
    }
}
