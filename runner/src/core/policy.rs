//! Bounds on how many agent invocations one feature loop may spend.
//!
//! An invocation that exhausts its turn budget leaves the directive where it
//! was, and the loop would otherwise re-dispatch it forever.

use thiserror::Error;

use crate::core::types::{ActionType, Directive};

/// Configured loop bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopLimits {
    /// Maximum agent invocations per loop.
    pub max_iterations: u32,
    /// Consecutive turn-budget-exhausted invocations tolerated on an unchanged directive.
    pub max_stalled_invocations: u32,
}

/// A loop bound was hit before dispatching the next invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimitExceeded {
    #[error("max_iterations reached after {max_iterations} agent invocations")]
    MaxIterations { max_iterations: u32 },
    #[error(
        "no progress on {action} (phase {phase}): {count} consecutive invocations exhausted their turn budget"
    )]
    Stalled {
        action: ActionType,
        phase: String,
        count: u32,
    },
}

type ProgressKey = (ActionType, String, Option<String>);

fn owned_key(directive: &Directive) -> ProgressKey {
    let (action, phase, task) = directive.progress_key();
    (action, phase.to_string(), task.map(str::to_string))
}

/// Tracks invocations within one loop and decides whether another is allowed.
#[derive(Debug, Clone)]
pub struct LoopGuard {
    limits: LoopLimits,
    invocations: u32,
    exhausted_key: Option<ProgressKey>,
    exhausted_streak: u32,
}

impl LoopGuard {
    pub fn new(limits: LoopLimits) -> Self {
        Self {
            limits,
            invocations: 0,
            exhausted_key: None,
            exhausted_streak: 0,
        }
    }

    /// Check whether `directive` may be dispatched.
    pub fn admit(&self, directive: &Directive) -> Result<(), LimitExceeded> {
        if self.invocations >= self.limits.max_iterations {
            return Err(LimitExceeded::MaxIterations {
                max_iterations: self.limits.max_iterations,
            });
        }
        if self.exhausted_streak >= self.limits.max_stalled_invocations
            && self.exhausted_key.as_ref() == Some(&owned_key(directive))
        {
            return Err(LimitExceeded::Stalled {
                action: directive.action,
                phase: directive.current_phase.clone(),
                count: self.exhausted_streak,
            });
        }
        Ok(())
    }

    /// Record a finished invocation of `directive`.
    pub fn record(&mut self, directive: &Directive, turn_budget_exhausted: bool) {
        self.invocations += 1;
        if !turn_budget_exhausted {
            self.exhausted_key = None;
            self.exhausted_streak = 0;
            return;
        }
        let key = owned_key(directive);
        if self.exhausted_key.as_ref() == Some(&key) {
            self.exhausted_streak += 1;
        } else {
            self.exhausted_key = Some(key);
            self.exhausted_streak = 1;
        }
    }

    pub fn invocations(&self) -> u32 {
        self.invocations
    }
}
