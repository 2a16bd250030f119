//! Autonomous directive-consumption runner.
//!
//! Reads the next directive for a feature from the `sdlc` state machine,
//! dispatches agent-actionable work to an LLM agent, and stops at terminal
//! phases, human gates, and errors.

use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{debug, info};

use autopilot::batch::{format_result, format_summary, run_all};
use autopilot::core::registry::AgentRegistry;
use autopilot::core::types::{RunResult, StopReason};
use autopilot::exit_codes;
use autopilot::io::config::{RunnerConfig, config_path, load_config};
use autopilot::io::driver::{AgentMessage, ClaudeCliDriver};
use autopilot::io::gates::{GateRunner, all_passed, format_results};
use autopilot::io::state_machine::CliStateMachine;
use autopilot::logging;
use autopilot::looping::{LoopOptions, run_feature};
use autopilot::plan::{check_feature, format_plan, plan_feature};

const LOG_TEXT_LIMIT: usize = 160;

#[derive(Parser)]
#[command(
    name = "autopilot",
    version,
    about = "Drive sdlc features forward with LLM agents until a human is needed"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone, Default)]
struct CommonArgs {
    /// Model for every agent, overriding config.
    #[arg(long, env = "AUTOPILOT_MODEL")]
    model: Option<String>,
    /// Turn bound for each agent invocation, overriding config and heavy directives.
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    max_turns: Option<u32>,
    /// Project root (defaults to the current directory).
    #[arg(long, value_name = "DIR")]
    cwd: Option<PathBuf>,
    /// State machine binary.
    #[arg(long, env = "AUTOPILOT_BIN")]
    bin: Option<String>,
    /// Config file (defaults to `<root>/.autopilot/config.toml`).
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Run one feature until it is done, needs a human, or fails.
    Run {
        feature: String,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Run every feature not already in a terminal phase.
    RunAll {
        /// Features to run concurrently (default from config, 1 = sequential).
        #[arg(long)]
        jobs: Option<usize>,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Show what `run` would do next, without executing anything.
    Plan {
        feature: String,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Run the current directive's auto shell gates.
    Check {
        feature: String,
        #[command(flatten)]
        common: CommonArgs,
    },
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() {
                exit_codes::USAGE
            } else {
                exit_codes::OK
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };
    logging::init();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::ERROR);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run { feature, common } => cmd_run(&feature, &common),
        Command::RunAll { jobs, common } => cmd_run_all(jobs, &common),
        Command::Plan { feature, common } => cmd_plan(&feature, &common),
        Command::Check { feature, common } => cmd_check(&feature, &common),
    }
}

/// Everything a command needs, resolved from flags and config.
struct Setup {
    root: PathBuf,
    config: RunnerConfig,
    registry: AgentRegistry,
    state_machine: CliStateMachine,
}

fn prepare(common: &CommonArgs, jobs: Option<usize>) -> Result<Setup> {
    let cwd = env::current_dir().context("resolve current directory")?;
    let root = match &common.cwd {
        Some(dir) => cwd.join(dir),
        None => cwd,
    };
    let config_file = match &common.config {
        Some(path) => root.join(path),
        None => config_path(&root),
    };
    let mut config = load_config(&config_file)?;
    if let Some(bin) = &common.bin {
        config.state_machine_bin = bin.clone();
    }
    if let Some(jobs) = jobs {
        config.jobs = jobs;
    }
    config.validate().context("invalid flags")?;

    // Per-action config first, then the command-line model on top.
    let registry = AgentRegistry::builtin()
        .with_overrides(None, &config.agents)
        .with_overrides(common.model.as_deref(), &BTreeMap::new());
    registry.validate()?;

    let state_machine =
        CliStateMachine::new(&config.state_machine_bin, &root, config.client_timeout());
    debug!(root = %root.display(), config = %config_file.display(), "prepared");
    Ok(Setup {
        root,
        config,
        registry,
        state_machine,
    })
}

fn loop_options(ctx: &Setup, common: &CommonArgs) -> LoopOptions {
    let mut options = LoopOptions::from_config(&ctx.root, &ctx.config);
    options.max_turns_override = common.max_turns;
    options
}

fn cmd_run(feature: &str, common: &CommonArgs) -> Result<i32> {
    let ctx = prepare(common, None)?;
    let driver = ClaudeCliDriver::new(&ctx.config.agent_bin);
    let options = loop_options(&ctx, common);
    let result = run_feature(
        &ctx.state_machine,
        &driver,
        &ctx.registry,
        &options,
        feature,
        |message| log_message(feature, message),
    );
    print_result(&result);
    Ok(exit_code(std::slice::from_ref(&result)))
}

fn cmd_run_all(jobs: Option<usize>, common: &CommonArgs) -> Result<i32> {
    let ctx = prepare(common, jobs)?;
    let driver = ClaudeCliDriver::new(&ctx.config.agent_bin);
    let options = loop_options(&ctx, common);
    let results = run_all(
        &ctx.state_machine,
        &driver,
        &ctx.registry,
        &options,
        &ctx.config.terminal_phases,
        ctx.config.jobs,
        &log_message,
    )?;
    if results.is_empty() {
        println!("no pending features");
        return Ok(exit_codes::OK);
    }
    print!("{}", format_summary(&results));
    Ok(exit_code(&results))
}

fn cmd_plan(feature: &str, common: &CommonArgs) -> Result<i32> {
    let ctx = prepare(common, None)?;
    let plan = plan_feature(&ctx.state_machine, &ctx.registry, feature)?;
    print!("{}", format_plan(&plan));
    Ok(exit_codes::OK)
}

fn cmd_check(feature: &str, common: &CommonArgs) -> Result<i32> {
    let ctx = prepare(common, None)?;
    let runner = GateRunner::new(ctx.config.gate_timeout(), ctx.config.gate_output_limit_bytes);
    let results = check_feature(&ctx.state_machine, &runner, feature, &ctx.root)?;
    if results.is_empty() {
        println!("{feature}: no gates");
        return Ok(exit_codes::OK);
    }
    print!("{}", format_results(&results));
    Ok(if all_passed(&results) {
        exit_codes::OK
    } else {
        exit_codes::ERROR
    })
}

fn print_result(result: &RunResult) {
    println!("{}", format_result(result));
    if result.stopped_at == StopReason::HumanGate
        && let Some(hint) = &result.resume_hint
    {
        println!("resume: {hint}");
    }
}

fn exit_code(results: &[RunResult]) -> i32 {
    if results.iter().any(RunResult::is_error) {
        exit_codes::ERROR
    } else {
        exit_codes::OK
    }
}

/// Observer for agent messages: logging only.
fn log_message(feature: &str, message: &AgentMessage) {
    match message {
        AgentMessage::System { session_id, model } => {
            info!(feature, ?session_id, ?model, "agent session");
        }
        AgentMessage::Assistant {
            text, tool_uses, ..
        } => {
            let text = first_line(text);
            info!(feature, text = %text, tools = ?tool_uses, "agent");
        }
        AgentMessage::Result {
            outcome,
            num_turns,
            cost_usd,
            ..
        } => {
            info!(feature, ?outcome, ?num_turns, ?cost_usd, "agent result");
        }
        AgentMessage::Other { kind, .. } => debug!(feature, kind = %kind, "agent message"),
    }
}

fn first_line(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default().trim();
    match line.char_indices().nth(LOG_TEXT_LIMIT) {
        Some((idx, _)) => format!("{}…", &line[..idx]),
        None => line.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_flags() {
        let cli = Cli::parse_from([
            "autopilot",
            "run",
            "auth-login",
            "--model",
            "opus",
            "--max-turns",
            "12",
            "--cwd",
            "/tmp/project",
            "--bin",
            "/opt/sdlc",
        ]);
        let Command::Run { feature, common } = cli.command else {
            panic!("expected run");
        };
        assert_eq!(feature, "auth-login");
        assert_eq!(common.model.as_deref(), Some("opus"));
        assert_eq!(common.max_turns, Some(12));
        assert_eq!(common.cwd, Some(PathBuf::from("/tmp/project")));
        assert_eq!(common.bin.as_deref(), Some("/opt/sdlc"));
    }

    #[test]
    fn parse_run_all_jobs() {
        let cli = Cli::parse_from(["autopilot", "run-all", "--jobs", "4"]);
        assert!(matches!(
            cli.command,
            Command::RunAll { jobs: Some(4), .. }
        ));
    }

    #[test]
    fn zero_max_turns_is_rejected() {
        assert!(Cli::try_parse_from(["autopilot", "run", "f", "--max-turns", "0"]).is_err());
    }

    #[test]
    fn plan_and_check_take_a_feature() {
        assert!(matches!(
            Cli::parse_from(["autopilot", "plan", "f"]).command,
            Command::Plan { .. }
        ));
        assert!(matches!(
            Cli::parse_from(["autopilot", "check", "f"]).command,
            Command::Check { .. }
        ));
        assert!(Cli::try_parse_from(["autopilot", "plan"]).is_err());
    }

    #[test]
    fn first_line_is_clipped() {
        assert_eq!(first_line("hello\nworld"), "hello");
        let long = "x".repeat(LOG_TEXT_LIMIT + 10);
        assert_eq!(first_line(&long).chars().count(), LOG_TEXT_LIMIT + 1);
    }

    #[test]
    fn exit_code_reflects_errors() {
        let ok = RunResult {
            feature: "a".to_string(),
            phase: None,
            actions_completed: 0,
            stopped_at: StopReason::HumanGate,
            message: None,
            resume_hint: None,
            error: None,
        };
        let failed = RunResult {
            stopped_at: StopReason::Error,
            error: Some("boom".to_string()),
            ..ok.clone()
        };
        assert_eq!(exit_code(std::slice::from_ref(&ok)), exit_codes::OK);
        assert_eq!(exit_code(&[ok, failed]), exit_codes::ERROR);
    }
}
