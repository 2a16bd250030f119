//! Batch driver tests: listing filter, ordering, and the worker pool.

use std::sync::Mutex;

use autopilot::batch::{BatchSummary, format_summary, pending_features, run_all};
use autopilot::core::registry::AgentRegistry;
use autopilot::core::types::{ActionType, StopReason};
use autopilot::io::config::RunnerConfig;
use autopilot::io::driver::AgentMessage;
use autopilot::looping::LoopOptions;
use autopilot::test_support::{
    ScriptedDriver, ScriptedStateMachine, directive, directive_in, project_root,
};

fn terminal_phases() -> Vec<String> {
    RunnerConfig::default().terminal_phases
}

/// Five features: two finish, one waits on a human, one fails, one is already released.
fn scripted() -> (ScriptedStateMachine, ScriptedDriver) {
    let sm = ScriptedStateMachine::with_features(&[
        ("alpha", "draft"),
        ("bravo", "specified"),
        ("charlie", "released"),
        ("delta", "implementation"),
        ("echo", "draft"),
    ]);
    sm.push_directive(directive_in("alpha", "released", ActionType::Done))
        .push_directive(directive_in("bravo", "specified", ActionType::ApproveSpec))
        .push_error("delta", "sdlc next failed: corrupt state")
        .push_directive(directive("echo", ActionType::CreateSpec))
        .push_directive(directive_in("echo", "released", ActionType::Done));
    let driver = ScriptedDriver::new();
    driver.push_success("s-echo");
    (sm, driver)
}

#[test]
fn pending_features_skip_terminal_phases() {
    let (sm, _) = scripted();
    let pending = pending_features(&sm, &terminal_phases()).expect("list");
    assert_eq!(pending, vec!["alpha", "bravo", "delta", "echo"]);
}

#[test]
fn sequential_batch_returns_one_result_per_feature_in_order() {
    let root = project_root();
    let (sm, driver) = scripted();
    let options = LoopOptions::from_config(root.path(), &RunnerConfig::default());
    let seen = Mutex::new(Vec::new());
    let observer = |feature: &str, _message: &AgentMessage| {
        seen.lock().expect("lock").push(feature.to_string());
    };

    let results = run_all(
        &sm,
        &driver,
        &AgentRegistry::builtin(),
        &options,
        &terminal_phases(),
        1,
        &observer,
    )
    .expect("run all");

    let features: Vec<&str> = results.iter().map(|r| r.feature.as_str()).collect();
    assert_eq!(features, vec!["alpha", "bravo", "delta", "echo"]);
    let reasons: Vec<StopReason> = results.iter().map(|r| r.stopped_at).collect();
    assert_eq!(
        reasons,
        vec![
            StopReason::Done,
            StopReason::HumanGate,
            StopReason::Error,
            StopReason::Done
        ]
    );
    assert_eq!(
        BatchSummary::from_results(&results),
        BatchSummary {
            done: 2,
            human_gate: 1,
            error: 1
        }
    );
    assert!(seen.lock().expect("lock").iter().all(|f| f == "echo"));
    assert!(format_summary(&results).starts_with("4 features: 2 done, 1 human_gate, 1 error\n"));
}

#[test]
fn worker_pool_matches_sequential_order() {
    let root = project_root();
    let (sm, driver) = scripted();
    let options = LoopOptions::from_config(root.path(), &RunnerConfig::default());
    let observer = |_: &str, _: &AgentMessage| {};

    let results = run_all(
        &sm,
        &driver,
        &AgentRegistry::builtin(),
        &options,
        &terminal_phases(),
        3,
        &observer,
    )
    .expect("run all");

    let features: Vec<&str> = results.iter().map(|r| r.feature.as_str()).collect();
    assert_eq!(features, vec!["alpha", "bravo", "delta", "echo"]);
    assert_eq!(results[3].stopped_at, StopReason::Done);
    assert_eq!(results[3].actions_completed, 1);
    for feature in ["alpha", "bravo", "delta", "echo"] {
        assert_eq!(sm.remaining(feature), 0, "{feature}");
    }
}

#[test]
fn listing_failure_is_an_error() {
    let root = project_root();
    let sm = ScriptedStateMachine::failing_list("sdlc: not initialized");
    let options = LoopOptions::from_config(root.path(), &RunnerConfig::default());
    let observer = |_: &str, _: &AgentMessage| {};

    let err = run_all(
        &sm,
        &ScriptedDriver::new(),
        &AgentRegistry::builtin(),
        &options,
        &terminal_phases(),
        1,
        &observer,
    )
    .unwrap_err();

    assert!(format!("{err:#}").contains("not initialized"));
}
