//! Driver abstraction for agent invocation.
//!
//! The [`AgentDriver`] trait decouples the control loop from the concrete agent
//! backend (currently the `claude` CLI in stream-json mode). An invocation
//! yields a lazily produced, finite sequence of [`AgentMessage`]s; tests use
//! scripted drivers that replay predetermined messages without spawning
//! processes.

use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::io::process::{StreamingChild, truncate_with_notice};

pub const DEFAULT_AGENT_BIN: &str = "claude";

const STDERR_LIMIT_BYTES: usize = 64 * 1024;
const ERROR_DETAIL_LIMIT: usize = 2_000;

/// One structured user message fed to the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptMessage {
    pub text: String,
}

/// Parameters for a driver invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRequest {
    /// Working directory for the agent.
    pub workdir: PathBuf,
    /// Input stream; the runner currently always sends a single message.
    pub prompt: Vec<PromptMessage>,
    /// Session to resume, if one was saved for this feature.
    pub resume: Option<String>,
    pub model: String,
    pub system_prompt: String,
    pub tools: Vec<String>,
    pub max_turns: u32,
}

/// How an invocation's final result message ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultOutcome {
    Success,
    /// The turn budget ran out before the agent finished.
    MaxTurns,
    /// Any other reported failure (`subtype` kept for logging).
    Error(String),
}

/// A message produced by the agent environment.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentMessage {
    /// Session initialization.
    System {
        session_id: Option<String>,
        model: Option<String>,
    },
    Assistant {
        session_id: Option<String>,
        text: String,
        tool_uses: Vec<String>,
    },
    /// Final message of an invocation.
    Result {
        session_id: Option<String>,
        outcome: ResultOutcome,
        num_turns: Option<u32>,
        cost_usd: Option<f64>,
        summary: Option<String>,
    },
    /// Anything the runner does not interpret (tool results, partial events).
    Other {
        kind: String,
        session_id: Option<String>,
    },
}

impl AgentMessage {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            AgentMessage::System { session_id, .. }
            | AgentMessage::Assistant { session_id, .. }
            | AgentMessage::Result { session_id, .. }
            | AgentMessage::Other { session_id, .. } => session_id.as_deref(),
        }
    }

    /// Parse one line of `--output-format stream-json` output.
    pub fn parse_line(line: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(line).context("parse agent message")?;
        let kind = str_field(&value, "type")
            .ok_or_else(|| anyhow!("agent message missing type"))?
            .to_string();
        let session_id = str_field(&value, "session_id").map(str::to_string);

        let message = match kind.as_str() {
            "system" => AgentMessage::System {
                session_id,
                model: str_field(&value, "model").map(str::to_string),
            },
            "assistant" => {
                let (text, tool_uses) = content_summary(&value);
                AgentMessage::Assistant {
                    session_id,
                    text,
                    tool_uses,
                }
            }
            "result" => {
                let subtype = str_field(&value, "subtype").unwrap_or("success");
                let is_error = value.get("is_error").and_then(Value::as_bool).unwrap_or(false);
                let outcome = match subtype {
                    "error_max_turns" => ResultOutcome::MaxTurns,
                    "success" if !is_error => ResultOutcome::Success,
                    other => ResultOutcome::Error(other.to_string()),
                };
                AgentMessage::Result {
                    session_id,
                    outcome,
                    num_turns: value
                        .get("num_turns")
                        .and_then(Value::as_u64)
                        .and_then(|n| u32::try_from(n).ok()),
                    cost_usd: value.get("total_cost_usd").and_then(Value::as_f64),
                    summary: str_field(&value, "result").map(str::to_string),
                }
            }
            _ => AgentMessage::Other { kind, session_id },
        };
        Ok(message)
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

fn content_summary(value: &Value) -> (String, Vec<String>) {
    let mut texts = Vec::new();
    let mut tools = Vec::new();
    let blocks = value
        .get("message")
        .and_then(|message| message.get("content"))
        .and_then(Value::as_array);
    for block in blocks.into_iter().flatten() {
        match str_field(block, "type") {
            Some("text") => {
                if let Some(text) = str_field(block, "text") {
                    texts.push(text.to_string());
                }
            }
            Some("tool_use") => {
                if let Some(name) = str_field(block, "name") {
                    tools.push(name.to_string());
                }
            }
            _ => {}
        }
    }
    (texts.join("\n"), tools)
}

/// Lazily produced agent output. Dropping it abandons the invocation.
pub type MessageStream<'a> = Box<dyn Iterator<Item = Result<AgentMessage>> + 'a>;

/// Abstraction over agent execution environments.
pub trait AgentDriver {
    /// Start an invocation. Errors returned here or yielded by the stream are
    /// invocation failures.
    fn invoke(&self, request: &AgentRequest) -> Result<MessageStream<'_>>;
}

/// Driver that spawns `claude -p` with stream-json input and output.
#[derive(Debug, Clone)]
pub struct ClaudeCliDriver {
    bin: PathBuf,
}

impl ClaudeCliDriver {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }

    fn command(&self, request: &AgentRequest) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("-p")
            .arg("--input-format")
            .arg("stream-json")
            .arg("--output-format")
            .arg("stream-json")
            // stream-json output requires verbose mode in print mode.
            .arg("--verbose")
            .arg("--model")
            .arg(&request.model)
            .arg("--append-system-prompt")
            .arg(&request.system_prompt)
            .arg("--allowedTools")
            .arg(request.tools.join(","))
            .arg("--max-turns")
            .arg(request.max_turns.to_string());
        if let Some(session) = &request.resume {
            cmd.arg("--resume").arg(session);
        }
        cmd.current_dir(&request.workdir);
        cmd
    }
}

#[derive(Serialize)]
struct InputEnvelope<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    message: InputMessage<'a>,
}

#[derive(Serialize)]
struct InputMessage<'a> {
    role: &'static str,
    content: [InputText<'a>; 1],
}

#[derive(Serialize)]
struct InputText<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    text: &'a str,
}

/// Encode the prompt stream as newline-delimited stream-json user messages.
pub fn encode_prompt_stream(prompt: &[PromptMessage]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    for message in prompt {
        let envelope = InputEnvelope {
            kind: "user",
            message: InputMessage {
                role: "user",
                content: [InputText {
                    kind: "text",
                    text: &message.text,
                }],
            },
        };
        serde_json::to_writer(&mut buf, &envelope).context("encode prompt message")?;
        buf.push(b'\n');
    }
    Ok(buf)
}

impl AgentDriver for ClaudeCliDriver {
    #[instrument(skip_all, fields(model = %request.model, resume = request.resume.is_some(), max_turns = request.max_turns))]
    fn invoke(&self, request: &AgentRequest) -> Result<MessageStream<'_>> {
        info!(workdir = %request.workdir.display(), "starting agent");
        let input = encode_prompt_stream(&request.prompt)?;
        let child = StreamingChild::spawn(self.command(request), &input, STDERR_LIMIT_BYTES)
            .with_context(|| format!("start {}", self.bin.display()))?;
        Ok(Box::new(ClaudeStream {
            child,
            saw_result: false,
            done: false,
        }))
    }
}

struct ClaudeStream {
    child: StreamingChild,
    saw_result: bool,
    done: bool,
}

impl ClaudeStream {
    fn finish(&mut self) -> Option<Result<AgentMessage>> {
        self.done = true;
        let exit = match self.child.finish() {
            Ok(exit) => exit,
            Err(err) => return Some(Err(err)),
        };
        if exit.status.success() {
            debug!("agent exited cleanly");
            return None;
        }
        let stderr = truncate_with_notice(
            String::from_utf8_lossy(&exit.stderr).trim().to_string(),
            ERROR_DETAIL_LIMIT,
            exit.stderr_truncated,
        );
        if self.saw_result {
            // The result message already reported the failure mode.
            warn!(exit_code = ?exit.status.code(), "agent exited non-zero after its result");
            return None;
        }
        Some(Err(anyhow!(
            "agent exited with status {:?} before producing a result: {}",
            exit.status.code(),
            stderr
        )))
    }
}

impl Iterator for ClaudeStream {
    type Item = Result<AgentMessage>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let line = match self.child.next_line() {
                Some(Ok(line)) => line,
                Some(Err(err)) => {
                    self.done = true;
                    return Some(Err(err));
                }
                None => return self.finish(),
            };
            if line.trim().is_empty() {
                continue;
            }
            let parsed = AgentMessage::parse_line(&line).with_context(|| {
                let snippet = truncate_with_notice(line.clone(), 200, 0);
                format!("unexpected agent output: {snippet}")
            });
            match parsed {
                Ok(message) => {
                    if matches!(message, AgentMessage::Result { .. }) {
                        self.saw_result = true;
                    }
                    return Some(Ok(message));
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
    }
}
