//! Shared deterministic types for the directive contract and loop results.
//!
//! These types mirror the JSON emitted by the external lifecycle state machine
//! (`sdlc next --json`) plus the runner's own result types. They carry no I/O
//! and must remain stable across runs.

use std::fmt;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// The closed set of instructions a directive can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    CreateSpec,
    ApproveSpec,
    ReviseSpec,
    CreateDesign,
    ApproveDesign,
    ReviseDesign,
    CreateTasks,
    ImplementTask,
    FixChecks,
    ReviewCode,
    AddressReview,
    ApproveMerge,
    Merge,
    WaitForHuman,
    Done,
}

/// How the runner treats an action type. Exactly one applies per action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Lifecycle finished; nothing left to automate.
    Terminal,
    /// A human decision is required before automation can continue.
    HumanGate,
    /// An agent can perform the action.
    Agent,
}

impl ActionType {
    pub const ALL: [ActionType; 15] = [
        ActionType::CreateSpec,
        ActionType::ApproveSpec,
        ActionType::ReviseSpec,
        ActionType::CreateDesign,
        ActionType::ApproveDesign,
        ActionType::ReviseDesign,
        ActionType::CreateTasks,
        ActionType::ImplementTask,
        ActionType::FixChecks,
        ActionType::ReviewCode,
        ActionType::AddressReview,
        ActionType::ApproveMerge,
        ActionType::Merge,
        ActionType::WaitForHuman,
        ActionType::Done,
    ];

    pub fn disposition(self) -> Disposition {
        match self {
            ActionType::Done => Disposition::Terminal,
            ActionType::ApproveSpec
            | ActionType::ApproveDesign
            | ActionType::ApproveMerge
            | ActionType::WaitForHuman => Disposition::HumanGate,
            ActionType::CreateSpec
            | ActionType::ReviseSpec
            | ActionType::CreateDesign
            | ActionType::ReviseDesign
            | ActionType::CreateTasks
            | ActionType::ImplementTask
            | ActionType::FixChecks
            | ActionType::ReviewCode
            | ActionType::AddressReview
            | ActionType::Merge => Disposition::Agent,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.disposition() == Disposition::Terminal
    }

    pub fn is_human_gate(self) -> bool {
        self.disposition() == Disposition::HumanGate
    }

    /// Artifact the action produces or gates on, as named by the state machine CLI.
    pub fn artifact(self) -> Option<&'static str> {
        match self {
            ActionType::CreateSpec | ActionType::ApproveSpec | ActionType::ReviseSpec => {
                Some("spec")
            }
            ActionType::CreateDesign | ActionType::ApproveDesign | ActionType::ReviseDesign => {
                Some("design")
            }
            ActionType::CreateTasks => Some("tasks"),
            ActionType::ReviewCode | ActionType::AddressReview => Some("review"),
            ActionType::ApproveMerge | ActionType::Merge => Some("merge"),
            ActionType::ImplementTask
            | ActionType::FixChecks
            | ActionType::WaitForHuman
            | ActionType::Done => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::CreateSpec => "create_spec",
            ActionType::ApproveSpec => "approve_spec",
            ActionType::ReviseSpec => "revise_spec",
            ActionType::CreateDesign => "create_design",
            ActionType::ApproveDesign => "approve_design",
            ActionType::ReviseDesign => "revise_design",
            ActionType::CreateTasks => "create_tasks",
            ActionType::ImplementTask => "implement_task",
            ActionType::FixChecks => "fix_checks",
            ActionType::ReviewCode => "review_code",
            ActionType::AddressReview => "address_review",
            ActionType::ApproveMerge => "approve_merge",
            ActionType::Merge => "merge",
            ActionType::WaitForHuman => "wait_for_human",
            ActionType::Done => "done",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of verification gate attached to a directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateType {
    Shell,
    Human,
    StepBack,
}

impl GateType {
    pub fn as_str(self) -> &'static str {
        match self {
            GateType::Shell => "shell",
            GateType::Human => "human",
            GateType::StepBack => "step_back",
        }
    }
}

/// A named verification check. Only `shell` gates with `auto = true` execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub gate_type: GateType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub auto: bool,
    /// Retry budget consumed by the approval path, never by the gate runner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl GateDefinition {
    pub fn is_executable(&self) -> bool {
        self.auto && self.gate_type == GateType::Shell
    }
}

/// The single next required action for one feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directive {
    pub feature: String,
    #[serde(default)]
    pub title: String,
    pub current_phase: String,
    pub action: ActionType,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default)]
    pub is_heavy: bool,
    #[serde(default)]
    pub timeout_minutes: u32,
    #[serde(default)]
    pub gates: Vec<GateDefinition>,
}

impl Directive {
    /// Gates the gate runner would actually execute, in declaration order.
    pub fn auto_shell_gates(&self) -> impl Iterator<Item = &GateDefinition> {
        self.gates.iter().filter(|gate| gate.is_executable())
    }

    /// Identity used to detect a loop that makes no progress.
    pub fn progress_key(&self) -> (ActionType, &str, Option<&str>) {
        (self.action, &self.current_phase, self.task_id.as_deref())
    }
}

/// One entry of `sdlc feature list --json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSummary {
    pub feature: String,
    pub phase: String,
}

/// A task created through the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRef {
    pub id: String,
    pub title: String,
}

/// Why a per-feature loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Done,
    HumanGate,
    Error,
}

impl StopReason {
    pub const ALL: [StopReason; 3] = [StopReason::Done, StopReason::HumanGate, StopReason::Error];

    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::Done => "done",
            StopReason::HumanGate => "human_gate",
            StopReason::Error => "error",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of one pass through the per-feature control loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub feature: String,
    /// Last phase observed from a directive (`None` if no directive was ever fetched).
    pub phase: Option<String>,
    pub actions_completed: u32,
    pub stopped_at: StopReason,
    /// Human-facing message surfaced at a human gate.
    pub message: Option<String>,
    /// Command a human runs to let automation continue.
    pub resume_hint: Option<String>,
    /// Rendered error chain when `stopped_at == Error`.
    pub error: Option<String>,
}

impl RunResult {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Feature ids become file names under `.autopilot/sessions/`.
pub fn validate_feature_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(anyhow!("feature id must not be empty"));
    }
    if id.contains('/') {
        return Err(anyhow!("feature id must not contain '/'"));
    }
    if id == "." || id == ".." {
        return Err(anyhow!("feature id must not be '{id}'"));
    }
    if id
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
    {
        return Err(anyhow!("feature id must be [A-Za-z0-9._-] only (got '{id}')"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directive_parses_minimal_json() {
        let raw = r#"{
            "feature": "auth-login",
            "current_phase": "specified",
            "action": "implement_task",
            "task_id": "T-2"
        }"#;
        let directive: Directive = serde_json::from_str(raw).expect("parse");
        assert_eq!(directive.action, ActionType::ImplementTask);
        assert_eq!(directive.task_id.as_deref(), Some("T-2"));
        assert!(directive.gates.is_empty());
        assert!(!directive.is_heavy);
    }

    #[test]
    fn directive_parses_gates() {
        let raw = r#"{
            "feature": "auth-login",
            "title": "Login",
            "current_phase": "implementation",
            "action": "fix_checks",
            "message": "fix it",
            "is_heavy": true,
            "timeout_minutes": 20,
            "gates": [
                {"name": "build", "type": "shell", "command": "cargo build", "auto": true, "max_retries": 2},
                {"name": "ux", "type": "human", "auto": false},
                {"name": "rethink", "type": "step_back", "auto": true}
            ]
        }"#;
        let directive: Directive = serde_json::from_str(raw).expect("parse");
        let names: Vec<&str> = directive
            .auto_shell_gates()
            .map(|gate| gate.name.as_str())
            .collect();
        assert_eq!(names, vec!["build"]);
        assert_eq!(directive.gates[0].max_retries, Some(2));
        assert_eq!(directive.gates[2].gate_type, GateType::StepBack);
    }

    #[test]
    fn unknown_action_is_rejected() {
        let raw = r#"{"feature": "f", "current_phase": "p", "action": "launch_rockets"}"#;
        assert!(serde_json::from_str::<Directive>(raw).is_err());
    }

    #[test]
    fn exactly_one_disposition_per_action() {
        for action in ActionType::ALL {
            let flags = [
                action.is_terminal(),
                action.is_human_gate(),
                action.disposition() == Disposition::Agent,
            ];
            assert_eq!(flags.iter().filter(|f| **f).count(), 1, "{action}");
        }
    }

    #[test]
    fn action_wire_names_match_serde() {
        for action in ActionType::ALL {
            let json = serde_json::to_string(&action).expect("serialize");
            assert_eq!(json, format!("\"{}\"", action.as_str()));
        }
    }

    #[test]
    fn feature_ids_are_path_safe() {
        validate_feature_id("auth-login_v2.1").expect("valid");
        assert!(validate_feature_id("").is_err());
        assert!(validate_feature_id("..").is_err());
        let err = validate_feature_id("a/b").unwrap_err();
        assert!(err.to_string().contains("must not contain"));
        assert!(validate_feature_id("has space").is_err());
    }
}
