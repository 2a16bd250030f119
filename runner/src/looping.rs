//! Per-feature control loop for `autopilot run`.
//!
//! Each iteration re-fetches the directive, classifies it, and either stops
//! (terminal, human gate, escalation, loop bound) or dispatches one agent
//! invocation and loops again. Failures never escape as `Err`: they are
//! folded into the returned [`RunResult`].

use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::policy::{LoopGuard, LoopLimits};
use crate::core::registry::{AgentConfig, AgentRegistry, Verdict};
use crate::core::types::{Directive, RunResult, StopReason, validate_feature_id};
use crate::io::config::RunnerConfig;
use crate::io::driver::{AgentDriver, AgentMessage, AgentRequest, PromptMessage, ResultOutcome};
use crate::io::prompt::PromptEngine;
use crate::io::session_store;
use crate::io::state_machine::StateMachine;

/// Settings shared by every feature loop in one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOptions {
    /// Project root: agent working directory and home of `.autopilot/`.
    pub root: PathBuf,
    /// State machine binary named in prompts and resume hints.
    pub state_machine_bin: String,
    pub max_turns: u32,
    pub heavy_max_turns: u32,
    /// `--max-turns`; wins over both configured bounds.
    pub max_turns_override: Option<u32>,
    pub limits: LoopLimits,
}

impl LoopOptions {
    pub fn from_config(root: impl Into<PathBuf>, cfg: &RunnerConfig) -> Self {
        Self {
            root: root.into(),
            state_machine_bin: cfg.state_machine_bin.clone(),
            max_turns: cfg.max_turns,
            heavy_max_turns: cfg.heavy_max_turns,
            max_turns_override: None,
            limits: cfg.loop_limits(),
        }
    }

    /// Turn bound for one invocation of `directive`.
    pub fn turn_bound(&self, directive: &Directive) -> u32 {
        match self.max_turns_override {
            Some(turns) => turns,
            None if directive.is_heavy => self.heavy_max_turns,
            None => self.max_turns,
        }
    }
}

/// Command a human runs to let automation continue past `directive`.
pub fn resume_hint(directive: &Directive, bin: &str) -> String {
    if let Some(command) = &directive.next_command {
        return command.clone();
    }
    let artifact = directive.action.artifact().unwrap_or("<artifact>");
    format!("{bin} artifact approve {} {artifact}", directive.feature)
}

struct Progress<'a> {
    feature: &'a str,
    phase: Option<String>,
    actions_completed: u32,
}

impl Progress<'_> {
    fn finish(
        self,
        stopped_at: StopReason,
        message: Option<String>,
        resume_hint: Option<String>,
        error: Option<String>,
    ) -> RunResult {
        RunResult {
            feature: self.feature.to_string(),
            phase: self.phase,
            actions_completed: self.actions_completed,
            stopped_at,
            message,
            resume_hint,
            error,
        }
    }

    fn failed(self, err: &anyhow::Error) -> RunResult {
        self.finish(StopReason::Error, None, None, Some(format!("{err:#}")))
    }
}

/// Drive one feature until it is done, needs a human, or fails.
///
/// `on_message` sees every agent message; it is an observer only and cannot
/// influence control flow.
#[instrument(skip_all, fields(feature = %feature))]
pub fn run_feature<S, D, F>(
    state_machine: &S,
    driver: &D,
    registry: &AgentRegistry,
    options: &LoopOptions,
    feature: &str,
    mut on_message: F,
) -> RunResult
where
    S: StateMachine + ?Sized,
    D: AgentDriver + ?Sized,
    F: FnMut(&AgentMessage),
{
    let mut progress = Progress {
        feature,
        phase: None,
        actions_completed: 0,
    };
    if let Err(err) = validate_feature_id(feature) {
        return progress.failed(&err);
    }
    let engine = match PromptEngine::new() {
        Ok(engine) => engine,
        Err(err) => return progress.failed(&err),
    };
    let mut guard = LoopGuard::new(options.limits);

    loop {
        let directive = match state_machine.directive(feature) {
            Ok(directive) => directive,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "directive fetch failed");
                return progress.failed(&err);
            }
        };
        if directive.feature != feature {
            let err = anyhow!(
                "state machine answered `next {feature}` with a directive for `{}`",
                directive.feature
            );
            warn!(err = %err, "directive names another feature");
            return progress.failed(&err);
        }
        info!(
            action = directive.action.as_str(),
            phase = %directive.current_phase,
            "directive"
        );
        progress.phase = Some(directive.current_phase.clone());

        let config = match registry.classify(directive.action) {
            Verdict::Terminal => {
                info!(actions = progress.actions_completed, "feature done");
                return progress.finish(StopReason::Done, None, None, None);
            }
            Verdict::HumanGate => {
                let hint = resume_hint(&directive, &options.state_machine_bin);
                info!(hint = %hint, "waiting for human");
                return progress.finish(
                    StopReason::HumanGate,
                    Some(directive.message.clone()),
                    Some(hint),
                    None,
                );
            }
            Verdict::Escalate => {
                warn!(action = directive.action.as_str(), "no agent registered, escalating");
                let message = format!(
                    "no agent is registered for {}; a human must perform it. {}",
                    directive.action,
                    directive.message.trim()
                );
                let hint = resume_hint(&directive, &options.state_machine_bin);
                return progress.finish(
                    StopReason::HumanGate,
                    Some(message.trim_end().to_string()),
                    Some(hint),
                    None,
                );
            }
            Verdict::Agent(config) => config,
        };

        if let Err(limit) = guard.admit(&directive) {
            warn!(%limit, "loop bound reached");
            return progress.failed(&anyhow::Error::new(limit));
        }

        match dispatch(
            &engine,
            driver,
            config,
            options,
            feature,
            &directive,
            &mut on_message,
        ) {
            Ok(exhausted) => {
                progress.actions_completed += 1;
                guard.record(&directive, exhausted);
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "agent invocation failed, clearing session");
                if let Err(clear_err) = session_store::clear(&options.root, feature) {
                    warn!(err = %format!("{clear_err:#}"), "failed to clear session");
                }
                return progress.failed(&err);
            }
        }
    }
}

/// One agent invocation. Returns whether the turn budget ran out.
fn dispatch<D, F>(
    engine: &PromptEngine,
    driver: &D,
    config: &AgentConfig,
    options: &LoopOptions,
    feature: &str,
    directive: &Directive,
    on_message: &mut F,
) -> Result<bool>
where
    D: AgentDriver + ?Sized,
    F: FnMut(&AgentMessage),
{
    let prompt = engine.render(directive, &options.state_machine_bin)?;
    let resume = session_store::load(&options.root, feature);
    let request = AgentRequest {
        workdir: options.root.clone(),
        prompt: vec![PromptMessage { text: prompt }],
        resume: resume.clone(),
        model: config.model.clone(),
        system_prompt: config.system_prompt.clone(),
        tools: config.tools.clone(),
        max_turns: options.turn_bound(directive),
    };
    info!(
        action = directive.action.as_str(),
        model = %request.model,
        resumed = resume.is_some(),
        "invoking agent"
    );

    let stream = driver
        .invoke(&request)
        .with_context(|| format!("invoke agent for {}", directive.action))?;

    let mut session = resume;
    let mut exhausted = false;
    for message in stream {
        let message = message.with_context(|| format!("agent stream for {}", directive.action))?;
        on_message(&message);
        if let Some(id) = message.session_id()
            && session.as_deref() != Some(id)
        {
            session_store::save(&options.root, feature, id)?;
            debug!(session = id, "saved session");
            session = Some(id.to_string());
        }
        if let AgentMessage::Result {
            outcome, num_turns, ..
        } = &message
        {
            match outcome {
                ResultOutcome::Success => info!(?num_turns, "agent finished"),
                ResultOutcome::MaxTurns => {
                    warn!(?num_turns, "agent exhausted its turn budget");
                    exhausted = true;
                }
                ResultOutcome::Error(subtype) => {
                    warn!(subtype = %subtype, ?num_turns, "agent reported an error result");
                }
            }
        }
    }
    Ok(exhausted)
}
