//! Read-only commands: `plan` (dry-run classification) and `check`
//! (pre-flight of a directive's auto shell gates).

use std::fmt::Write as _;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::instrument;

use crate::core::registry::{AgentRegistry, Verdict};
use crate::core::types::{Directive, validate_feature_id};
use crate::io::gates::{GateResult, GateRunner};
use crate::io::state_machine::StateMachine;

/// What `run` would do with the current directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanVerdict {
    Terminal,
    HumanGate,
    Agent { model: String },
    Escalate,
}

impl PlanVerdict {
    fn from_verdict(verdict: Verdict<'_>) -> Self {
        match verdict {
            Verdict::Terminal => PlanVerdict::Terminal,
            Verdict::HumanGate => PlanVerdict::HumanGate,
            Verdict::Agent(config) => PlanVerdict::Agent {
                model: config.model.clone(),
            },
            Verdict::Escalate => PlanVerdict::Escalate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub directive: Directive,
    pub verdict: PlanVerdict,
}

/// Fetch and classify the directive for `feature`. Nothing is executed.
#[instrument(skip_all, fields(feature = %feature))]
pub fn plan_feature<S: StateMachine + ?Sized>(
    state_machine: &S,
    registry: &AgentRegistry,
    feature: &str,
) -> Result<Plan> {
    validate_feature_id(feature)?;
    let directive = state_machine.directive(feature)?;
    let verdict = PlanVerdict::from_verdict(registry.classify(directive.action));
    Ok(Plan { directive, verdict })
}

pub fn format_plan(plan: &Plan) -> String {
    let directive = &plan.directive;
    let verdict = match &plan.verdict {
        PlanVerdict::Terminal => "terminal".to_string(),
        PlanVerdict::HumanGate => "human_gate".to_string(),
        PlanVerdict::Agent { model } => format!("agent {model}"),
        PlanVerdict::Escalate => "escalate".to_string(),
    };
    let mut buf = String::new();
    let _ = writeln!(
        buf,
        "{} ({}): {}",
        directive.feature, directive.current_phase, directive.action
    );
    let _ = writeln!(buf, "verdict: {verdict}");
    if directive.gates.is_empty() {
        return buf;
    }
    let _ = writeln!(buf, "gates:");
    for gate in &directive.gates {
        let mode = if gate.is_executable() { "auto" } else { "manual" };
        let _ = write!(buf, "  - {} ({}, {mode}", gate.name, gate.gate_type.as_str());
        if let Some(retries) = gate.max_retries {
            let _ = write!(buf, ", retries {retries}");
        }
        let _ = writeln!(buf, ")");
    }
    buf
}

/// Run the current directive's gates in `workdir` without invoking an agent.
#[instrument(skip_all, fields(feature = %feature))]
pub fn check_feature<S: StateMachine + ?Sized>(
    state_machine: &S,
    gate_runner: &GateRunner,
    feature: &str,
    workdir: &Path,
) -> Result<Vec<GateResult>> {
    validate_feature_id(feature)?;
    let directive = state_machine
        .directive(feature)
        .with_context(|| format!("load gates for {feature}"))?;
    Ok(gate_runner.run_gates(&directive.gates, workdir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::core::types::{ActionType, GateType};
    use crate::io::gates::all_passed;
    use crate::test_support::{ScriptedStateMachine, directive, shell_gate};

    #[test]
    fn plan_reports_agent_model_and_gates() {
        let sm = ScriptedStateMachine::new();
        let mut d = directive("auth", ActionType::ReviewCode);
        let mut build = shell_gate("build", "cargo build");
        build.max_retries = Some(2);
        let mut ux = shell_gate("ux", "true");
        ux.gate_type = GateType::Human;
        d.gates = vec![build, ux];
        sm.push_directive(d);

        let plan = plan_feature(&sm, &AgentRegistry::builtin(), "auth").expect("plan");
        assert_eq!(
            plan.verdict,
            PlanVerdict::Agent {
                model: "opus".to_string()
            }
        );
        assert_eq!(
            format_plan(&plan),
            "auth (draft): review_code\n\
             verdict: agent opus\n\
             gates:\n  - build (shell, auto, retries 2)\n  - ux (human, manual)\n"
        );
        assert_eq!(sm.calls(), vec!["next auth"]);
    }

    #[test]
    fn plan_distinguishes_every_verdict() {
        let sm = ScriptedStateMachine::new();
        sm.push_directive(directive("f", ActionType::Done))
            .push_directive(directive("f", ActionType::ApproveMerge))
            .push_directive(directive("f", ActionType::Merge));
        let registry = AgentRegistry::builtin();
        let empty = AgentRegistry::from_configs(HashMap::new());

        let terminal = plan_feature(&sm, &registry, "f").expect("plan");
        assert_eq!(terminal.verdict, PlanVerdict::Terminal);
        let gate = plan_feature(&sm, &registry, "f").expect("plan");
        assert_eq!(gate.verdict, PlanVerdict::HumanGate);
        let escalate = plan_feature(&sm, &empty, "f").expect("plan");
        assert_eq!(escalate.verdict, PlanVerdict::Escalate);
        assert!(format_plan(&escalate).contains("verdict: escalate"));
    }

    #[test]
    fn check_runs_gates_in_workdir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sm = ScriptedStateMachine::new();
        let mut d = directive("f", ActionType::FixChecks);
        d.gates = vec![shell_gate("ok", "true"), shell_gate("bad", "false")];
        sm.push_directive(d);

        let results =
            check_feature(&sm, &GateRunner::default(), "f", temp.path()).expect("check");
        assert_eq!(results.len(), 2);
        assert!(results[0].passed);
        assert!(!results[1].passed);
        assert!(!all_passed(&results));
    }
}
