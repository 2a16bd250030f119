//! Runner configuration stored under `.autopilot/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;

use crate::core::policy::LoopLimits;
use crate::core::registry::AgentOverride;
use crate::core::types::{ActionType, Disposition};
use crate::io::driver::DEFAULT_AGENT_BIN;
use crate::io::gates::{DEFAULT_GATE_TIMEOUT, DEFAULT_OUTPUT_LIMIT_BYTES};
use crate::io::state_machine::DEFAULT_BIN;

/// Runner configuration (TOML).
///
/// Intended to be edited by humans. Missing fields take the defaults below;
/// CLI flags override whatever is loaded.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerConfig {
    /// State machine binary (`sdlc`).
    pub state_machine_bin: String,

    /// Agent CLI binary (`claude`).
    pub agent_bin: String,

    /// Turn bound for one agent invocation.
    pub max_turns: u32,

    /// Turn bound for directives flagged `is_heavy`.
    pub heavy_max_turns: u32,

    /// Agent invocations allowed per feature loop.
    pub max_iterations: u32,

    /// Consecutive turn-budget-exhausted invocations tolerated on an unchanged directive.
    pub max_stalled_invocations: u32,

    pub gate_timeout_secs: u64,

    pub gate_output_limit_bytes: usize,

    /// Timeout for each state machine CLI call.
    pub client_timeout_secs: u64,

    /// Phases `run-all` treats as finished and skips.
    pub terminal_phases: Vec<String>,

    /// Concurrent feature loops for `run-all`.
    pub jobs: usize,

    /// Per-action model/tool overrides, keyed by action type.
    pub agents: BTreeMap<ActionType, AgentOverride>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            state_machine_bin: DEFAULT_BIN.to_string(),
            agent_bin: DEFAULT_AGENT_BIN.to_string(),
            max_turns: 30,
            heavy_max_turns: 60,
            max_iterations: 25,
            max_stalled_invocations: 3,
            gate_timeout_secs: DEFAULT_GATE_TIMEOUT.as_secs(),
            gate_output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
            client_timeout_secs: 60,
            terminal_phases: vec!["released".to_string(), "archived".to_string()],
            jobs: 1,
            agents: BTreeMap::new(),
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.state_machine_bin.trim().is_empty() {
            return Err(anyhow!("state_machine_bin must not be empty"));
        }
        if self.agent_bin.trim().is_empty() {
            return Err(anyhow!("agent_bin must not be empty"));
        }
        if self.max_turns == 0 || self.heavy_max_turns == 0 {
            return Err(anyhow!("max_turns and heavy_max_turns must be > 0"));
        }
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.max_stalled_invocations == 0 {
            return Err(anyhow!("max_stalled_invocations must be > 0"));
        }
        if self.gate_timeout_secs == 0 {
            return Err(anyhow!("gate_timeout_secs must be > 0"));
        }
        if self.gate_output_limit_bytes == 0 {
            return Err(anyhow!("gate_output_limit_bytes must be > 0"));
        }
        if self.client_timeout_secs == 0 {
            return Err(anyhow!("client_timeout_secs must be > 0"));
        }
        if self.jobs == 0 {
            return Err(anyhow!("jobs must be > 0"));
        }
        for (action, over) in &self.agents {
            if action.disposition() != Disposition::Agent {
                return Err(anyhow!("agents.{action}: action is not agent-actionable"));
            }
            if over.model.as_deref().is_some_and(|m| m.trim().is_empty()) {
                return Err(anyhow!("agents.{action}.model must not be empty"));
            }
            if over.tools.as_ref().is_some_and(Vec::is_empty) {
                return Err(anyhow!("agents.{action}.tools must not be empty"));
            }
        }
        Ok(())
    }

    pub fn loop_limits(&self) -> LoopLimits {
        LoopLimits {
            max_iterations: self.max_iterations,
            max_stalled_invocations: self.max_stalled_invocations,
        }
    }

    pub fn gate_timeout(&self) -> Duration {
        Duration::from_secs(self.gate_timeout_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}

/// Default config location under a project root.
pub fn config_path(root: &Path) -> PathBuf {
    root.join(".autopilot").join("config.toml")
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunnerConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunnerConfig> {
    if !path.exists() {
        let cfg = RunnerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunnerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}
