//! Loop-level scenarios for `run_feature`.
//!
//! These tests drive the per-feature control loop with a scripted state
//! machine and a scripted agent driver to verify stop reasons, session
//! handling, and loop bounds.

use std::collections::HashMap;

use autopilot::core::policy::LoopLimits;
use autopilot::core::registry::AgentRegistry;
use autopilot::core::types::{ActionType, RunResult, StopReason};
use autopilot::io::config::RunnerConfig;
use autopilot::io::driver::{AgentMessage, ResultOutcome};
use autopilot::io::session_store;
use autopilot::looping::{LoopOptions, run_feature};
use autopilot::test_support::{
    ScriptedDriver, ScriptedStateMachine, assistant_message, directive, directive_in,
    project_root, result_message, system_message,
};

fn options(root: &std::path::Path) -> LoopOptions {
    LoopOptions::from_config(root, &RunnerConfig::default())
}

fn run(
    sm: &ScriptedStateMachine,
    driver: &ScriptedDriver,
    options: &LoopOptions,
    feature: &str,
) -> RunResult {
    run_feature(sm, driver, &AgentRegistry::builtin(), options, feature, |_| {})
}

#[test]
fn terminal_directive_stops_done_without_invoking_agent() {
    let root = project_root();
    let sm = ScriptedStateMachine::new();
    sm.push_directive(directive_in("auth", "released", ActionType::Done));
    let driver = ScriptedDriver::new();

    let result = run(&sm, &driver, &options(root.path()), "auth");

    assert_eq!(result.stopped_at, StopReason::Done);
    assert_eq!(result.phase.as_deref(), Some("released"));
    assert_eq!(result.actions_completed, 0);
    assert!(result.error.is_none());
    assert!(driver.requests().is_empty());
}

#[test]
fn human_gate_surfaces_message_and_resume_hint() {
    let root = project_root();
    let sm = ScriptedStateMachine::new();
    let mut gate = directive_in("auth", "specified", ActionType::ApproveSpec);
    gate.message = "Review docs/auth/spec.md".to_string();
    sm.push_directive(gate);
    let driver = ScriptedDriver::new();

    let result = run(&sm, &driver, &options(root.path()), "auth");

    assert_eq!(result.stopped_at, StopReason::HumanGate);
    assert_eq!(result.message.as_deref(), Some("Review docs/auth/spec.md"));
    assert_eq!(
        result.resume_hint.as_deref(),
        Some("sdlc artifact approve auth spec")
    );
    assert!(driver.requests().is_empty());
}

#[test]
fn fetch_failure_stops_error_with_actions_unchanged() {
    let root = project_root();
    let sm = ScriptedStateMachine::new();
    sm.push_directive(directive("auth", ActionType::CreateSpec))
        .push_error("auth", "sdlc next failed: database locked");
    let driver = ScriptedDriver::new();
    driver.push_success("s-1");

    let result = run(&sm, &driver, &options(root.path()), "auth");

    assert_eq!(result.stopped_at, StopReason::Error);
    assert_eq!(result.actions_completed, 1);
    assert!(
        result
            .error
            .as_deref()
            .expect("error")
            .contains("database locked")
    );
    // A fetch failure is not an invocation failure: the session survives.
    assert_eq!(
        session_store::load(root.path(), "auth").as_deref(),
        Some("s-1")
    );
}

#[test]
fn mid_stream_failure_clears_session_and_stops_error() {
    let root = project_root();
    session_store::save(root.path(), "auth", "s-old").expect("save");
    let sm = ScriptedStateMachine::new();
    sm.push_directive(directive("auth", ActionType::ImplementTask))
        .push_directive(directive("auth", ActionType::ImplementTask));
    let driver = ScriptedDriver::new();
    driver.push_success("s-old").push_stream_error(
        vec![system_message("s-new"), assistant_message("editing")],
        "connection reset",
    );

    let result = run(&sm, &driver, &options(root.path()), "auth");

    assert_eq!(result.stopped_at, StopReason::Error);
    assert_eq!(result.actions_completed, 1);
    assert!(
        result
            .error
            .as_deref()
            .expect("error")
            .contains("connection reset")
    );
    assert_eq!(session_store::load(root.path(), "auth"), None);
}

#[test]
fn directive_for_another_feature_is_rejected_before_dispatch() {
    let root = project_root();
    session_store::save(root.path(), "auth", "s-old").expect("save");
    let sm = ScriptedStateMachine::new();
    sm.push_reply("auth", directive("auth-canonical", ActionType::ImplementTask));
    let driver = ScriptedDriver::new();
    driver.push_stream_error(vec![system_message("s-new")], "connection reset");

    let result = run(&sm, &driver, &options(root.path()), "auth");

    assert_eq!(result.stopped_at, StopReason::Error);
    assert_eq!(result.feature, "auth");
    assert!(
        result
            .error
            .as_deref()
            .expect("error")
            .contains("auth-canonical")
    );
    assert!(driver.requests().is_empty());
    assert_eq!(session_store::load(root.path(), "auth-canonical"), None);
    assert_eq!(
        session_store::load(root.path(), "auth").as_deref(),
        Some("s-old")
    );
}

#[test]
fn driver_start_failure_clears_session() {
    let root = project_root();
    session_store::save(root.path(), "auth", "s-old").expect("save");
    let sm = ScriptedStateMachine::new();
    sm.push_directive(directive("auth", ActionType::CreateDesign));
    let driver = ScriptedDriver::new();
    driver.push_start_error("claude: command not found");

    let result = run(&sm, &driver, &options(root.path()), "auth");

    assert_eq!(result.stopped_at, StopReason::Error);
    assert_eq!(result.actions_completed, 0);
    assert_eq!(session_store::load(root.path(), "auth"), None);
}

#[test]
fn unregistered_action_escalates_as_human_gate() {
    let root = project_root();
    let sm = ScriptedStateMachine::new();
    sm.push_directive(directive("auth", ActionType::Merge));
    let driver = ScriptedDriver::new();
    let registry = AgentRegistry::from_configs(HashMap::new());

    let result = run_feature(&sm, &driver, &registry, &options(root.path()), "auth", |_| {});

    assert_eq!(result.stopped_at, StopReason::HumanGate);
    assert!(result.message.as_deref().expect("message").contains("merge"));
    assert!(result.error.is_none());
    assert!(driver.requests().is_empty());
}

#[test]
fn actions_accumulate_until_done() {
    let root = project_root();
    let sm = ScriptedStateMachine::new();
    let mut task = directive_in("auth", "implementation", ActionType::ImplementTask);
    task.task_id = Some("T-1".to_string());
    let mut heavy = directive_in("auth", "review", ActionType::ReviewCode);
    heavy.is_heavy = true;
    sm.push_directive(directive("auth", ActionType::CreateSpec))
        .push_directive(task)
        .push_directive(heavy)
        .push_directive(directive_in("auth", "released", ActionType::Done));
    let driver = ScriptedDriver::new();
    driver
        .push_success("s-1")
        .push_success("s-1")
        .push_success("s-2");

    let result = run(&sm, &driver, &options(root.path()), "auth");

    assert_eq!(result.stopped_at, StopReason::Done);
    assert_eq!(result.actions_completed, 3);
    assert_eq!(result.phase.as_deref(), Some("released"));
    let requests = driver.requests();
    assert_eq!(requests[0].resume, None);
    assert_eq!(requests[1].resume.as_deref(), Some("s-1"));
    assert_eq!(requests[2].model, "opus");
    assert_eq!(requests[2].max_turns, 60);
    assert!(requests[1].prompt[0].text.contains("Task: T-1"));
    assert_eq!(
        session_store::load(root.path(), "auth").as_deref(),
        Some("s-2")
    );
}

#[test]
fn session_is_persisted_before_stream_ends() {
    let root = project_root();
    let sm = ScriptedStateMachine::new();
    sm.push_directive(directive("auth", ActionType::CreateSpec))
        .push_directive(directive("auth", ActionType::Done));
    let driver = ScriptedDriver::new();
    driver.push_messages(vec![
        system_message("s-1"),
        assistant_message("thinking"),
        system_message("s-2"),
        result_message("s-2", ResultOutcome::Success),
    ]);

    let mut observed = Vec::new();
    let result = run_feature(
        &sm,
        &driver,
        &AgentRegistry::builtin(),
        &options(root.path()),
        "auth",
        |message| {
            if matches!(message, AgentMessage::Assistant { .. }) {
                observed.push(session_store::load(root.path(), "auth"));
            }
        },
    );

    assert_eq!(result.stopped_at, StopReason::Done);
    assert_eq!(observed, vec![Some("s-1".to_string())]);
    assert_eq!(
        session_store::load(root.path(), "auth").as_deref(),
        Some("s-2")
    );
}

#[test]
fn repeated_turn_budget_exhaustion_stops_error() {
    let root = project_root();
    let sm = ScriptedStateMachine::new();
    for _ in 0..5 {
        sm.push_directive(directive("auth", ActionType::FixChecks));
    }
    let driver = ScriptedDriver::new();
    for _ in 0..5 {
        driver.push_messages(vec![result_message("s-1", ResultOutcome::MaxTurns)]);
    }
    let mut opts = options(root.path());
    opts.limits = LoopLimits {
        max_iterations: 10,
        max_stalled_invocations: 2,
    };

    let result = run(&sm, &driver, &opts, "auth");

    assert_eq!(result.stopped_at, StopReason::Error);
    assert_eq!(result.actions_completed, 2);
    assert_eq!(driver.requests().len(), 2);
    assert!(result.error.as_deref().expect("error").contains("no progress"));
}

#[test]
fn max_iterations_caps_invocations() {
    let root = project_root();
    let sm = ScriptedStateMachine::new();
    for _ in 0..4 {
        sm.push_directive(directive("auth", ActionType::ImplementTask));
    }
    let driver = ScriptedDriver::new();
    for _ in 0..4 {
        driver.push_success("s-1");
    }
    let mut opts = options(root.path());
    opts.limits = LoopLimits {
        max_iterations: 3,
        max_stalled_invocations: 3,
    };

    let result = run(&sm, &driver, &opts, "auth");

    assert_eq!(result.stopped_at, StopReason::Error);
    assert_eq!(result.actions_completed, 3);
    assert!(
        result
            .error
            .as_deref()
            .expect("error")
            .contains("max_iterations")
    );
}
