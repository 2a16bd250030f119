//! Static action type → agent configuration lookup.
//!
//! Both the disposition of an action ([`ActionType::disposition`]) and the
//! builtin agent table ([`builtin_config`]) are exhaustive matches, so adding
//! an action type without deciding how it runs fails to compile.
//! [`AgentRegistry::validate`] re-checks completeness after overrides are applied.

use std::collections::{BTreeMap, HashMap};

use anyhow::{Result, bail};
use serde::Deserialize;

use crate::core::types::{ActionType, Disposition};

const DEFAULT_MODEL: &str = "sonnet";
const REVIEW_MODEL: &str = "opus";

const AUTHOR_TOOLS: &[&str] = &["Read", "Glob", "Grep", "Write", "Edit", "Bash(sdlc:*)"];
const CODER_TOOLS: &[&str] = &["Read", "Glob", "Grep", "Write", "Edit", "Bash"];
const REVIEWER_TOOLS: &[&str] = &["Read", "Glob", "Grep", "Bash(sdlc:*)", "Bash(git diff:*)"];
const MERGE_TOOLS: &[&str] = &["Read", "Bash(git:*)", "Bash(sdlc:*)"];

const AUTHOR_PROMPT: &str = "You write and revise lifecycle artifacts (specs, designs, task lists) \
for a governed software-delivery workflow. Write only the artifact you are asked for, at the path \
you are given, then submit it through the sdlc CLI.";
const CODER_PROMPT: &str = "You implement one task at a time in an existing codebase under a \
governed software-delivery workflow. Keep changes scoped to the task, keep the build green, and \
report completion through the sdlc CLI.";
const REVIEWER_PROMPT: &str = "You review code changes for a governed software-delivery workflow. \
Do not modify source files. Record findings as comments through the sdlc CLI, then approve or \
reject the review artifact.";
const MERGE_PROMPT: &str = "You integrate an approved feature branch. Merge only when the state \
machine says the feature is ready, resolve trivial conflicts, and report the result through the \
sdlc CLI.";

/// Model, system prompt and tool allowlist for one action type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub model: String,
    pub system_prompt: String,
    pub tools: Vec<String>,
}

/// Per-action adjustments read from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AgentOverride {
    pub model: Option<String>,
    pub tools: Option<Vec<String>>,
}

/// Classification of an action type against the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict<'a> {
    Terminal,
    HumanGate,
    Agent(&'a AgentConfig),
    /// Agent-actionable in principle, but nothing is registered for it.
    Escalate,
}

/// Builtin agent configuration for `action`, `None` for non-agent actions.
pub fn builtin_config(action: ActionType) -> Option<AgentConfig> {
    let (model, prompt, tools) = match action {
        ActionType::Done
        | ActionType::ApproveSpec
        | ActionType::ApproveDesign
        | ActionType::ApproveMerge
        | ActionType::WaitForHuman => return None,
        ActionType::CreateSpec
        | ActionType::ReviseSpec
        | ActionType::CreateDesign
        | ActionType::ReviseDesign
        | ActionType::CreateTasks => (DEFAULT_MODEL, AUTHOR_PROMPT, AUTHOR_TOOLS),
        ActionType::ImplementTask | ActionType::FixChecks | ActionType::AddressReview => {
            (DEFAULT_MODEL, CODER_PROMPT, CODER_TOOLS)
        }
        ActionType::ReviewCode => (REVIEW_MODEL, REVIEWER_PROMPT, REVIEWER_TOOLS),
        ActionType::Merge => (DEFAULT_MODEL, MERGE_PROMPT, MERGE_TOOLS),
    };
    Some(AgentConfig {
        model: model.to_string(),
        system_prompt: prompt.to_string(),
        tools: tools.iter().map(|tool| tool.to_string()).collect(),
    })
}

/// Read-only registry, built once at startup and shared across loops.
#[derive(Debug, Clone)]
pub struct AgentRegistry {
    configs: HashMap<ActionType, AgentConfig>,
}

impl AgentRegistry {
    /// Registry holding only the builtin table.
    pub fn builtin() -> Self {
        let configs = ActionType::ALL
            .into_iter()
            .filter_map(|action| builtin_config(action).map(|config| (action, config)))
            .collect();
        Self { configs }
    }

    /// Registry with an explicit table (used by tests to simulate gaps).
    pub fn from_configs(configs: HashMap<ActionType, AgentConfig>) -> Self {
        Self { configs }
    }

    /// Apply a global model override, then per-action overrides on top of it.
    pub fn with_overrides(
        mut self,
        model: Option<&str>,
        overrides: &BTreeMap<ActionType, AgentOverride>,
    ) -> Self {
        if let Some(model) = model {
            for config in self.configs.values_mut() {
                config.model = model.to_string();
            }
        }
        for (action, over) in overrides {
            let Some(config) = self.configs.get_mut(action) else {
                continue;
            };
            if let Some(model) = &over.model {
                config.model = model.clone();
            }
            if let Some(tools) = &over.tools {
                config.tools = tools.clone();
            }
        }
        self
    }

    /// Fail unless every agent-actionable action has a usable configuration
    /// and no terminal/human-gate action has one.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        for action in ActionType::ALL {
            match (action.disposition(), self.configs.get(&action)) {
                (Disposition::Agent, None) => {
                    errors.push(format!("{action}: no agent configuration registered"));
                }
                (Disposition::Agent, Some(config)) => {
                    if config.model.trim().is_empty() {
                        errors.push(format!("{action}: model must not be empty"));
                    }
                    if config.tools.is_empty() {
                        errors.push(format!("{action}: tool allowlist must not be empty"));
                    }
                }
                (Disposition::Terminal | Disposition::HumanGate, Some(_)) => {
                    errors.push(format!("{action}: not agent-actionable but has a configuration"));
                }
                (Disposition::Terminal | Disposition::HumanGate, None) => {}
            }
        }
        if !errors.is_empty() {
            bail!("agent registry incomplete:\n- {}", errors.join("\n- "));
        }
        Ok(())
    }

    pub fn config_for(&self, action: ActionType) -> Option<&AgentConfig> {
        self.configs.get(&action)
    }

    pub fn has_agent(&self, action: ActionType) -> bool {
        action.disposition() == Disposition::Agent && self.configs.contains_key(&action)
    }

    pub fn classify(&self, action: ActionType) -> Verdict<'_> {
        match action.disposition() {
            Disposition::Terminal => Verdict::Terminal,
            Disposition::HumanGate => Verdict::HumanGate,
            Disposition::Agent => match self.config_for(action) {
                Some(config) => Verdict::Agent(config),
                None => Verdict::Escalate,
            },
        }
    }
}
