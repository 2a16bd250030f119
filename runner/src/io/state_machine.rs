//! Client for the external lifecycle state machine (`sdlc` CLI).
//!
//! The state machine owns feature lifecycles; the runner only reads
//! directives and forwards the few mutations an operator needs. Every call is
//! a synchronous subprocess invocation in the configured working directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use crate::core::types::{Directive, FeatureSummary, TaskRef};
use crate::io::process::{CommandOutput, run_command_with_timeout};

pub const DEFAULT_BIN: &str = "sdlc";

const OUTPUT_LIMIT_BYTES: usize = 4 * 1024 * 1024;

/// Operations the runner consumes from the state machine.
pub trait StateMachine {
    /// Next directive for `feature`.
    fn directive(&self, feature: &str) -> Result<Directive>;
    fn draft_artifact(&self, feature: &str, artifact: &str) -> Result<()>;
    fn approve_artifact(&self, feature: &str, artifact: &str) -> Result<()>;
    fn reject_artifact(&self, feature: &str, artifact: &str, reason: Option<&str>) -> Result<()>;
    fn add_task(&self, feature: &str, title: &str) -> Result<TaskRef>;
    fn complete_task(&self, feature: &str, task_id: &str) -> Result<()>;
    fn add_comment(&self, feature: &str, body: &str, flag: Option<&str>) -> Result<()>;
    /// Administrative escape hatch; the loop never calls this.
    fn transition_phase(&self, feature: &str, phase: &str) -> Result<()>;
    fn list_features(&self) -> Result<Vec<FeatureSummary>>;
    /// Write an artifact file, resolving relative paths against the working directory.
    fn write_artifact_file(&self, path: &Path, content: &str) -> Result<PathBuf>;
}

/// [`StateMachine`] backed by the `sdlc` binary.
#[derive(Debug, Clone)]
pub struct CliStateMachine {
    bin: PathBuf,
    workdir: PathBuf,
    timeout: Duration,
}

impl CliStateMachine {
    pub fn new(bin: impl Into<PathBuf>, workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            workdir: workdir.into(),
            timeout,
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn run_json<T: DeserializeOwned>(&self, args: &[&str]) -> Result<T> {
        let stdout = self.run_capture(args)?;
        serde_json::from_str(stdout.trim())
            .with_context(|| format!("parse output of {} {}", self.bin.display(), args.join(" ")))
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<CommandOutput> {
        let output = self.run(args)?;
        if output.timed_out {
            return Err(anyhow!(
                "{} {} timed out after {}s",
                self.bin.display(),
                args.join(" "),
                self.timeout.as_secs()
            ));
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(exit_code = ?output.status.code(), "state machine command failed");
            return Err(anyhow!(
                "{} {} failed: {}",
                self.bin.display(),
                args.join(" "),
                stderr.trim()
            ));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        debug!(bin = %self.bin.display(), args = ?args, "running state machine command");
        let mut cmd = Command::new(&self.bin);
        cmd.args(args).current_dir(&self.workdir);
        run_command_with_timeout(cmd, self.timeout, OUTPUT_LIMIT_BYTES)
            .with_context(|| format!("spawn {} {}", self.bin.display(), args.join(" ")))
    }
}

impl StateMachine for CliStateMachine {
    #[instrument(skip_all, fields(feature = %feature))]
    fn directive(&self, feature: &str) -> Result<Directive> {
        self.run_json(&["next", "--for", feature, "--json"])
            .with_context(|| format!("fetch directive for {feature}"))
    }

    fn draft_artifact(&self, feature: &str, artifact: &str) -> Result<()> {
        self.run_checked(&["artifact", "draft", feature, artifact])?;
        Ok(())
    }

    fn approve_artifact(&self, feature: &str, artifact: &str) -> Result<()> {
        self.run_checked(&["artifact", "approve", feature, artifact])?;
        Ok(())
    }

    fn reject_artifact(&self, feature: &str, artifact: &str, reason: Option<&str>) -> Result<()> {
        let mut args = vec!["artifact", "reject", feature, artifact];
        if let Some(reason) = reason {
            args.extend(["--reason", reason]);
        }
        self.run_checked(&args)?;
        Ok(())
    }

    fn add_task(&self, feature: &str, title: &str) -> Result<TaskRef> {
        self.run_json(&["task", "add", feature, title, "--json"])
    }

    fn complete_task(&self, feature: &str, task_id: &str) -> Result<()> {
        self.run_checked(&["task", "complete", feature, task_id])?;
        Ok(())
    }

    fn add_comment(&self, feature: &str, body: &str, flag: Option<&str>) -> Result<()> {
        let mut args = vec!["comment", "add", feature, body];
        if let Some(flag) = flag {
            args.extend(["--flag", flag]);
        }
        self.run_checked(&args)?;
        Ok(())
    }

    fn transition_phase(&self, feature: &str, phase: &str) -> Result<()> {
        warn!(feature, phase, "forcing phase transition");
        self.run_checked(&["feature", "transition", feature, phase])?;
        Ok(())
    }

    fn list_features(&self) -> Result<Vec<FeatureSummary>> {
        self.run_json(&["feature", "list", "--json"])
            .context("list features")
    }

    fn write_artifact_file(&self, path: &Path, content: &str) -> Result<PathBuf> {
        write_artifact_file(&self.workdir, path, content)
    }
}

/// Write `content` to `path` (relative paths resolve against `workdir`).
pub fn write_artifact_file(workdir: &Path, path: &Path, content: &str) -> Result<PathBuf> {
    let resolved = if path.is_absolute() {
        path.to_path_buf()
    } else {
        workdir.join(path)
    };
    if let Some(parent) = resolved.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create artifact dir {}", parent.display()))?;
    }
    fs::write(&resolved, content)
        .with_context(|| format!("write artifact {}", resolved.display()))?;
    Ok(resolved)
}
