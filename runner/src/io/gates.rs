//! Gate runner: executes a directive's automatic shell gates.
//!
//! Only `type = "shell"` gates with `auto = true` spawn a process. Everything
//! else is reported as a passing, skipped result so it never blocks approval.
//! Retry budgets are not consulted here; retries belong to the approval path.

use std::fmt::Write as _;
use std::path::Path;
use std::process::Command;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::tokenizer::{TokenizeError, tokenize};
use crate::core::types::{GateDefinition, GateType};
use crate::io::process::{run_command_with_timeout, truncate_with_notice};

pub const DEFAULT_GATE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 8 * 1024;

const SUMMARY_LINE_LIMIT: usize = 200;

/// Why a gate failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateFailure {
    #[error("gate has no command")]
    EmptyCommand,
    #[error("invalid gate command: {0}")]
    InvalidCommand(#[from] TokenizeError),
    #[error("failed to run `{program}`: {reason}")]
    Spawn { program: String, reason: String },
    #[error("exited with status {}", exit_label(.code))]
    ExitStatus { code: Option<i32> },
    #[error("timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "signal".to_string(),
    }
}

/// Outcome of one gate. Produced fresh on every run, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateResult {
    pub name: String,
    pub gate_type: GateType,
    pub passed: bool,
    pub skipped: bool,
    /// Combined stdout+stderr, truncated.
    pub output: String,
    pub error: Option<GateFailure>,
    pub duration: Duration,
}

impl GateResult {
    fn skipped(gate: &GateDefinition) -> Self {
        Self {
            name: gate.name.clone(),
            gate_type: gate.gate_type,
            passed: true,
            skipped: true,
            output: String::new(),
            error: None,
            duration: Duration::ZERO,
        }
    }

    fn failed(gate: &GateDefinition, error: GateFailure, output: String, duration: Duration) -> Self {
        Self {
            name: gate.name.clone(),
            gate_type: gate.gate_type,
            passed: false,
            skipped: false,
            output,
            error: Some(error),
            duration,
        }
    }
}

/// Runs gates with a fixed per-gate timeout and output bound.
#[derive(Debug, Clone)]
pub struct GateRunner {
    timeout: Duration,
    output_limit_bytes: usize,
}

impl Default for GateRunner {
    fn default() -> Self {
        Self::new(DEFAULT_GATE_TIMEOUT, DEFAULT_OUTPUT_LIMIT_BYTES)
    }
}

impl GateRunner {
    pub fn new(timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            timeout,
            output_limit_bytes,
        }
    }

    /// Run every gate in order; the result list has the same length and order.
    #[instrument(skip_all, fields(gates = gates.len(), workdir = %workdir.display()))]
    pub fn run_gates(&self, gates: &[GateDefinition], workdir: &Path) -> Vec<GateResult> {
        gates.iter().map(|gate| self.run_gate(gate, workdir)).collect()
    }

    pub fn run_gate(&self, gate: &GateDefinition, workdir: &Path) -> GateResult {
        if !gate.is_executable() {
            debug!(gate = %gate.name, gate_type = gate.gate_type.as_str(), auto = gate.auto, "gate skipped");
            return GateResult::skipped(gate);
        }

        let argv = match tokenize(gate.command.as_deref().unwrap_or_default()) {
            Ok(argv) => argv,
            Err(err) => {
                warn!(gate = %gate.name, err = %err, "gate command does not parse");
                return GateResult::failed(gate, err.into(), String::new(), Duration::ZERO);
            }
        };
        let Some((program, args)) = argv.split_first() else {
            warn!(gate = %gate.name, "gate command is empty");
            return GateResult::failed(gate, GateFailure::EmptyCommand, String::new(), Duration::ZERO);
        };

        info!(gate = %gate.name, program = %program, "running gate");
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(workdir);

        let start = Instant::now();
        let output = match run_command_with_timeout(cmd, self.timeout, self.output_limit_bytes) {
            Ok(output) => output,
            Err(err) => {
                let failure = GateFailure::Spawn {
                    program: program.clone(),
                    reason: format!("{err:#}"),
                };
                return GateResult::failed(gate, failure, String::new(), start.elapsed());
            }
        };
        let duration = start.elapsed();
        let text = output.combined(self.output_limit_bytes);

        if output.timed_out {
            warn!(gate = %gate.name, timeout_secs = self.timeout.as_secs(), "gate timed out");
            return GateResult::failed(gate, GateFailure::TimedOut(self.timeout), text, duration);
        }
        if !output.status.success() {
            warn!(gate = %gate.name, exit_code = ?output.status.code(), "gate failed");
            let failure = GateFailure::ExitStatus {
                code: output.status.code(),
            };
            return GateResult::failed(gate, failure, text, duration);
        }

        debug!(gate = %gate.name, duration_ms = duration.as_millis() as u64, "gate passed");
        GateResult {
            name: gate.name.clone(),
            gate_type: gate.gate_type,
            passed: true,
            skipped: false,
            output: text,
            error: None,
            duration,
        }
    }
}

/// True when no gate failed (skipped gates count as passed).
pub fn all_passed(results: &[GateResult]) -> bool {
    results.iter().all(|result| result.passed)
}

/// One human-readable line per gate.
pub fn format_results(results: &[GateResult]) -> String {
    let mut buf = String::new();
    for result in results {
        let line = if result.skipped {
            format!("SKIP {} ({})", result.name, result.gate_type.as_str())
        } else if result.passed {
            match last_line(&result.output) {
                Some(last) => format!("PASS {}: {}", result.name, clip(last)),
                None => format!("PASS {}", result.name),
            }
        } else {
            let detail = match (&result.error, last_line(&result.output)) {
                (Some(err), Some(last)) => format!("{err}: {}", clip(last)),
                (Some(err), None) => err.to_string(),
                (None, _) => clip(result.output.trim()),
            };
            format!("FAIL {}: {}", result.name, detail)
        };
        let _ = writeln!(buf, "{line}");
    }
    buf
}

fn last_line(output: &str) -> Option<&str> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("[truncated "))
        .next_back()
}

fn clip(line: &str) -> String {
    truncate_with_notice(line.to_string(), SUMMARY_LINE_LIMIT, 0).replace('\n', " ")
}
