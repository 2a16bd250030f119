//! Test-only helpers: directive builders and scripted fakes for the state
//! machine and agent driver seams.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Result, anyhow};

use crate::core::types::{ActionType, Directive, FeatureSummary, GateDefinition, GateType, TaskRef};
use crate::io::driver::{AgentDriver, AgentMessage, AgentRequest, MessageStream, ResultOutcome};
use crate::io::state_machine::StateMachine;

/// Create a deterministic directive with default fields and no gates.
pub fn directive(feature: &str, action: ActionType) -> Directive {
    Directive {
        feature: feature.to_string(),
        title: format!("{feature} title"),
        current_phase: "draft".to_string(),
        action,
        message: format!("{action} for {feature}"),
        next_command: None,
        output_path: None,
        transition_to: None,
        task_id: None,
        is_heavy: false,
        timeout_minutes: 0,
        gates: Vec::new(),
    }
}

/// Same as [`directive`] with an explicit phase.
pub fn directive_in(feature: &str, phase: &str, action: ActionType) -> Directive {
    Directive {
        current_phase: phase.to_string(),
        ..directive(feature, action)
    }
}

pub fn shell_gate(name: &str, command: &str) -> GateDefinition {
    GateDefinition {
        name: name.to_string(),
        gate_type: GateType::Shell,
        command: Some(command.to_string()),
        auto: true,
        max_retries: None,
    }
}

/// Write an executable `#!/bin/sh` script at `root/name`.
pub fn write_script(root: &Path, name: &str, body: &str) -> PathBuf {
    let path = root.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    let mut perms = fs::metadata(&path).expect("script metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("chmod script");
    path
}

/// Temporary project root with an empty `.autopilot/` directory.
pub fn project_root() -> tempfile::TempDir {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::create_dir_all(temp.path().join(".autopilot")).expect("create .autopilot");
    temp
}

pub fn system_message(session_id: &str) -> AgentMessage {
    AgentMessage::System {
        session_id: Some(session_id.to_string()),
        model: None,
    }
}

pub fn assistant_message(text: &str) -> AgentMessage {
    AgentMessage::Assistant {
        session_id: None,
        text: text.to_string(),
        tool_uses: Vec::new(),
    }
}

pub fn result_message(session_id: &str, outcome: ResultOutcome) -> AgentMessage {
    AgentMessage::Result {
        session_id: Some(session_id.to_string()),
        outcome,
        num_turns: Some(1),
        cost_usd: None,
        summary: None,
    }
}

/// State machine that replays queued directives per feature and records every call.
#[derive(Debug, Default)]
pub struct ScriptedStateMachine {
    directives: Mutex<HashMap<String, VecDeque<Result<Directive, String>>>>,
    features: Vec<FeatureSummary>,
    list_error: Option<String>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feature listing returned by `list_features`, as `(feature, phase)` pairs.
    pub fn with_features(features: &[(&str, &str)]) -> Self {
        Self {
            features: features
                .iter()
                .map(|(feature, phase)| FeatureSummary {
                    feature: feature.to_string(),
                    phase: phase.to_string(),
                })
                .collect(),
            ..Self::default()
        }
    }

    pub fn failing_list(message: &str) -> Self {
        Self {
            list_error: Some(message.to_string()),
            ..Self::default()
        }
    }

    /// Queue a directive for the feature it names.
    pub fn push_directive(&self, directive: Directive) -> &Self {
        let feature = directive.feature.clone();
        self.queue(&feature, Ok(directive));
        self
    }

    /// Queue `directive` as the reply to `next feature`, whatever feature it names.
    pub fn push_reply(&self, feature: &str, directive: Directive) -> &Self {
        self.queue(feature, Ok(directive));
        self
    }

    pub fn push_error(&self, feature: &str, message: &str) -> &Self {
        self.queue(feature, Err(message.to_string()));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    /// Directives still queued for `feature`.
    pub fn remaining(&self, feature: &str) -> usize {
        self.directives
            .lock()
            .expect("directives lock")
            .get(feature)
            .map_or(0, VecDeque::len)
    }

    fn queue(&self, feature: &str, entry: Result<Directive, String>) {
        self.directives
            .lock()
            .expect("directives lock")
            .entry(feature.to_string())
            .or_default()
            .push_back(entry);
    }

    fn record(&self, call: String) {
        self.calls.lock().expect("calls lock").push(call);
    }
}

impl StateMachine for ScriptedStateMachine {
    fn directive(&self, feature: &str) -> Result<Directive> {
        self.record(format!("next {feature}"));
        let next = self
            .directives
            .lock()
            .expect("directives lock")
            .get_mut(feature)
            .and_then(VecDeque::pop_front);
        match next {
            Some(Ok(directive)) => Ok(directive),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("no scripted directive for {feature}")),
        }
    }

    fn draft_artifact(&self, feature: &str, artifact: &str) -> Result<()> {
        self.record(format!("artifact draft {feature} {artifact}"));
        Ok(())
    }

    fn approve_artifact(&self, feature: &str, artifact: &str) -> Result<()> {
        self.record(format!("artifact approve {feature} {artifact}"));
        Ok(())
    }

    fn reject_artifact(&self, feature: &str, artifact: &str, reason: Option<&str>) -> Result<()> {
        self.record(format!(
            "artifact reject {feature} {artifact} {}",
            reason.unwrap_or("-")
        ));
        Ok(())
    }

    fn add_task(&self, feature: &str, title: &str) -> Result<TaskRef> {
        self.record(format!("task add {feature} {title}"));
        let id = format!("T-{}", self.calls().len());
        Ok(TaskRef {
            id,
            title: title.to_string(),
        })
    }

    fn complete_task(&self, feature: &str, task_id: &str) -> Result<()> {
        self.record(format!("task complete {feature} {task_id}"));
        Ok(())
    }

    fn add_comment(&self, feature: &str, body: &str, flag: Option<&str>) -> Result<()> {
        self.record(format!("comment add {feature} {body} {}", flag.unwrap_or("-")));
        Ok(())
    }

    fn transition_phase(&self, feature: &str, phase: &str) -> Result<()> {
        self.record(format!("feature transition {feature} {phase}"));
        Ok(())
    }

    fn list_features(&self) -> Result<Vec<FeatureSummary>> {
        self.record("feature list".to_string());
        match &self.list_error {
            Some(message) => Err(anyhow!(message.clone())),
            None => Ok(self.features.clone()),
        }
    }

    fn write_artifact_file(&self, path: &Path, _content: &str) -> Result<PathBuf> {
        self.record(format!("write {}", path.display()));
        Ok(path.to_path_buf())
    }
}

#[derive(Debug)]
enum Invocation {
    Stream(Vec<Result<AgentMessage, String>>),
    StartError(String),
}

/// Driver that replays one queued script per invocation and captures requests.
///
/// Invoking with an empty queue is an error, which keeps runaway loops visible.
#[derive(Debug, Default)]
pub struct ScriptedDriver {
    scripts: Mutex<VecDeque<Invocation>>,
    requests: Mutex<Vec<AgentRequest>>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_messages(&self, messages: Vec<AgentMessage>) -> &Self {
        self.push(Invocation::Stream(messages.into_iter().map(Ok).collect()));
        self
    }

    /// Yield `messages`, then fail mid-stream with `error`.
    pub fn push_stream_error(&self, messages: Vec<AgentMessage>, error: &str) -> &Self {
        let mut stream: Vec<_> = messages.into_iter().map(Ok).collect();
        stream.push(Err(error.to_string()));
        self.push(Invocation::Stream(stream));
        self
    }

    pub fn push_start_error(&self, error: &str) -> &Self {
        self.push(Invocation::StartError(error.to_string()));
        self
    }

    /// Convenience: a session init followed by a successful result.
    pub fn push_success(&self, session_id: &str) -> &Self {
        self.push_messages(vec![
            system_message(session_id),
            assistant_message("working"),
            result_message(session_id, ResultOutcome::Success),
        ])
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    fn push(&self, invocation: Invocation) {
        self.scripts.lock().expect("scripts lock").push_back(invocation);
    }
}

impl AgentDriver for ScriptedDriver {
    fn invoke(&self, request: &AgentRequest) -> Result<MessageStream<'_>> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        let next = self.scripts.lock().expect("scripts lock").pop_front();
        match next {
            Some(Invocation::Stream(items)) => Ok(Box::new(
                items.into_iter().map(|item| item.map_err(|err| anyhow!(err))),
            )),
            Some(Invocation::StartError(err)) => Err(anyhow!(err)),
            None => Err(anyhow!("no scripted invocation left")),
        }
    }
}
