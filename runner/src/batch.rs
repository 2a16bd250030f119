//! Multi-feature driver for `autopilot run-all`.

use std::fmt::Write as _;
use std::sync::{Mutex, PoisonError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use anyhow::{Context, Result};
use tracing::{info, instrument};

use crate::core::registry::AgentRegistry;
use crate::core::types::{RunResult, StopReason};
use crate::io::driver::{AgentDriver, AgentMessage};
use crate::io::state_machine::StateMachine;
use crate::looping::{LoopOptions, run_feature};

/// Observer shared by concurrent feature loops.
pub type SharedObserver<'a> = &'a (dyn Fn(&str, &AgentMessage) + Sync);

/// Features not already in one of `terminal_phases`, in listing order.
pub fn pending_features<S: StateMachine + ?Sized>(
    state_machine: &S,
    terminal_phases: &[String],
) -> Result<Vec<String>> {
    let features = state_machine.list_features().context("list features for run-all")?;
    Ok(features
        .into_iter()
        .filter(|summary| !terminal_phases.iter().any(|phase| *phase == summary.phase))
        .map(|summary| summary.feature)
        .collect())
}

/// Run every pending feature and return one result per feature, in listing order.
///
/// With `jobs == 1` features run strictly one after another. Larger values run
/// up to `jobs` loops at once; each feature is claimed by exactly one worker.
#[instrument(skip_all, fields(jobs))]
pub fn run_all<S, D>(
    state_machine: &S,
    driver: &D,
    registry: &AgentRegistry,
    options: &LoopOptions,
    terminal_phases: &[String],
    jobs: usize,
    observer: SharedObserver<'_>,
) -> Result<Vec<RunResult>>
where
    S: StateMachine + Sync + ?Sized,
    D: AgentDriver + Sync + ?Sized,
{
    let features = pending_features(state_machine, terminal_phases)?;
    info!(count = features.len(), "running pending features");

    let run_one = |feature: &str| {
        run_feature(state_machine, driver, registry, options, feature, |message| {
            observer(feature, message);
        })
    };

    let workers = jobs.clamp(1, features.len().max(1));
    if workers == 1 {
        return Ok(features.iter().map(|feature| run_one(feature)).collect());
    }

    let next = AtomicUsize::new(0);
    let slots: Mutex<Vec<Option<RunResult>>> = Mutex::new(vec![None; features.len()]);
    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    let index = next.fetch_add(1, Ordering::SeqCst);
                    let Some(feature) = features.get(index) else {
                        break;
                    };
                    let result = run_one(feature);
                    store_result(&slots, index, result);
                }
            });
        }
    });

    let slots = slots.into_inner().unwrap_or_else(PoisonError::into_inner);
    features
        .iter()
        .zip(slots)
        .map(|(feature, slot)| slot.with_context(|| format!("worker lost result for {feature}")))
        .collect()
}

/// Record a finished loop. A poisoned lock still accepts the result.
fn store_result(slots: &Mutex<Vec<Option<RunResult>>>, index: usize, result: RunResult) {
    slots.lock().unwrap_or_else(PoisonError::into_inner)[index] = Some(result);
}

/// Counts of results per stop reason.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub done: usize,
    pub human_gate: usize,
    pub error: usize,
}

impl BatchSummary {
    pub fn from_results(results: &[RunResult]) -> Self {
        let mut summary = Self::default();
        for result in results {
            match result.stopped_at {
                StopReason::Done => summary.done += 1,
                StopReason::HumanGate => summary.human_gate += 1,
                StopReason::Error => summary.error += 1,
            }
        }
        summary
    }

    pub fn count(&self, reason: StopReason) -> usize {
        match reason {
            StopReason::Done => self.done,
            StopReason::HumanGate => self.human_gate,
            StopReason::Error => self.error,
        }
    }

    pub fn total(&self) -> usize {
        self.done + self.human_gate + self.error
    }
}

/// One-line description of a finished loop.
pub fn format_result(result: &RunResult) -> String {
    let phase = result.phase.as_deref().unwrap_or("unknown");
    let actions = match result.actions_completed {
        1 => "1 action".to_string(),
        n => format!("{n} actions"),
    };
    match result.stopped_at {
        StopReason::Done => format!("{}: done at {phase} ({actions})", result.feature),
        StopReason::HumanGate => {
            let message = result
                .message
                .as_deref()
                .map(|m| m.lines().next().unwrap_or_default().trim())
                .filter(|m| !m.is_empty())
                .unwrap_or("human input required");
            format!(
                "{}: waiting for human at {phase} ({actions}): {message}",
                result.feature
            )
        }
        StopReason::Error => format!(
            "{}: error ({actions}): {}",
            result.feature,
            result.error.as_deref().unwrap_or("unknown error")
        ),
    }
}

/// Summary grouped by stop reason, groups in a fixed order.
pub fn format_summary(results: &[RunResult]) -> String {
    let summary = BatchSummary::from_results(results);
    let mut buf = String::new();
    let _ = writeln!(
        buf,
        "{} features: {} done, {} human_gate, {} error",
        summary.total(),
        summary.done,
        summary.human_gate,
        summary.error
    );
    for reason in StopReason::ALL {
        if summary.count(reason) == 0 {
            continue;
        }
        let _ = writeln!(buf, "{reason}:");
        for result in results.iter().filter(|r| r.stopped_at == reason) {
            let _ = writeln!(buf, "  {}", format_result(result));
            if let Some(hint) = &result.resume_hint {
                let _ = writeln!(buf, "    resume: {hint}");
            }
        }
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(feature: &str, stopped_at: StopReason) -> RunResult {
        RunResult {
            feature: feature.to_string(),
            phase: Some("draft".to_string()),
            actions_completed: 1,
            stopped_at,
            message: None,
            resume_hint: None,
            error: (stopped_at == StopReason::Error).then(|| "boom".to_string()),
        }
    }

    #[test]
    fn summary_counts_match_stop_reasons() {
        let results = vec![
            result("a", StopReason::Done),
            result("b", StopReason::Error),
            result("c", StopReason::Done),
            result("d", StopReason::HumanGate),
        ];
        let summary = BatchSummary::from_results(&results);
        assert_eq!(
            summary,
            BatchSummary {
                done: 2,
                human_gate: 1,
                error: 1
            }
        );
        assert_eq!(summary.total(), results.len());
    }

    #[test]
    fn summary_groups_in_fixed_order() {
        let mut gate = result("d", StopReason::HumanGate);
        gate.message = Some("approve the spec\nsecond line".to_string());
        gate.resume_hint = Some("sdlc artifact approve d spec".to_string());
        let text = format_summary(&[
            result("b", StopReason::Error),
            gate,
            result("a", StopReason::Done),
        ]);
        assert_eq!(
            text,
            "3 features: 1 done, 1 human_gate, 1 error\n\
             done:\n  a: done at draft (1 action)\n\
             human_gate:\n  d: waiting for human at draft (1 action): approve the spec\n    resume: sdlc artifact approve d spec\n\
             error:\n  b: error (1 action): boom\n"
        );
    }

    #[test]
    fn results_survive_a_poisoned_store() {
        let slots = Mutex::new(vec![None, None]);
        let _ = thread::scope(|scope| {
            scope
                .spawn(|| {
                    let _guard = slots.lock().expect("lock");
                    panic!("worker died holding the lock");
                })
                .join()
        });
        assert!(slots.is_poisoned());

        store_result(&slots, 1, result("b", StopReason::Done));

        let slots = slots.into_inner().unwrap_or_else(PoisonError::into_inner);
        assert_eq!(slots[0], None);
        assert_eq!(slots[1].as_ref().map(|r| r.feature.as_str()), Some("b"));
    }

    #[test]
    fn empty_groups_are_omitted() {
        let text = format_summary(&[result("a", StopReason::Done)]);
        assert!(!text.contains("error:"));
        assert!(!text.contains("human_gate:"));
    }
}
