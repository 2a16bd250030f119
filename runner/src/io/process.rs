//! Helpers for running child processes with timeouts and bounded output.

use std::io::{BufRead, BufReader, Lines, Read, Write};
use std::os::unix::process::CommandExt;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Stdout followed by stderr, lossily decoded, capped at `limit` bytes.
    pub fn combined(&self, limit: usize) -> String {
        let mut buf = String::from_utf8_lossy(&self.stdout).into_owned();
        if !self.stderr.is_empty() {
            if !buf.is_empty() && !buf.ends_with('\n') {
                buf.push('\n');
            }
            buf.push_str(&String::from_utf8_lossy(&self.stderr));
        }
        let dropped = self.stdout_truncated + self.stderr_truncated;
        truncate_with_notice(buf, limit, dropped)
    }
}

/// Cap `text` at `limit` bytes (on a char boundary), noting how much was dropped.
pub fn truncate_with_notice(mut text: String, limit: usize, already_dropped: usize) -> String {
    let mut dropped = already_dropped;
    if text.len() > limit {
        let mut cut = limit;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        dropped += text.len() - cut;
        text.truncate(cut);
    }
    if dropped > 0 {
        if !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&format!("[truncated {dropped} bytes]"));
    }
    text
}

/// Extra wait for output readers once the child is gone.
const READER_GRACE: Duration = Duration::from_secs(1);

type ReaderResult = Result<(Vec<u8>, usize)>;

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
///
/// The child runs in its own process group. On timeout the whole group is killed, so the call
/// returns shortly after `timeout` even when descendants hold the output pipes open.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

    debug!("spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };
    let pgid = child.id();

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_rx = spawn_reader(stdout, output_limit_bytes);
    let stderr_rx = spawn_reader(stderr, output_limit_bytes);

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing process group"
            );
            timed_out = true;
            kill_process_group(pgid);
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    // Descendants may keep the pipes open after the child exits.
    let deadline = (started + timeout).max(Instant::now()) + READER_GRACE;
    let mut lingering = false;
    let mut collect = |rx: &Receiver<ReaderResult>| -> Result<(Vec<u8>, usize)> {
        if let Some(result) = recv_output(rx, deadline) {
            return result;
        }
        if !lingering {
            warn!("output still open past the timeout, killing process group");
            lingering = true;
            kill_process_group(pgid);
        }
        Ok(recv_output(rx, Instant::now() + READER_GRACE)
            .transpose()?
            .unwrap_or_default())
    };
    let (stdout, stdout_truncated) = collect(&stdout_rx).context("collect stdout")?;
    let (stderr, stderr_truncated) = collect(&stderr_rx).context("collect stderr")?;
    timed_out |= lingering;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

fn spawn_reader<R: Read + Send + 'static>(reader: R, limit: usize) -> Receiver<ReaderResult> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(read_stream_limited(reader, limit));
    });
    rx
}

/// `None` when `deadline` passes first; the reader thread is then left to finish on its own.
fn recv_output(rx: &Receiver<ReaderResult>, deadline: Instant) -> Option<ReaderResult> {
    match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
        Ok(result) => Some(result),
        Err(RecvTimeoutError::Timeout) => None,
        Err(RecvTimeoutError::Disconnected) => Some(Err(anyhow!("output reader thread panicked"))),
    }
}

/// SIGKILL every process in group `pgid` through the shell's `kill` builtin.
/// Failures are logged; the group may already be gone.
fn kill_process_group(pgid: u32) {
    let status = Command::new("sh")
        .arg("-c")
        .arg(format!("kill -9 -{pgid}"))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match status {
        Ok(status) if status.success() => debug!(pgid, "killed process group"),
        Ok(status) => debug!(pgid, exit_code = ?status.code(), "process group already gone"),
        Err(err) => warn!(pgid, err = %err, "failed to signal process group"),
    }
}

/// A running child whose stdout is consumed line by line.
///
/// Stderr is drained on a background thread into a bounded buffer. Dropping
/// the value before [`StreamingChild::finish`] kills the child.
pub struct StreamingChild {
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
    stdin_handle: Option<thread::JoinHandle<Result<()>>>,
    stderr_handle: Option<thread::JoinHandle<Result<(Vec<u8>, usize)>>>,
    finished: bool,
}

/// Exit status and bounded stderr of a finished [`StreamingChild`].
#[derive(Debug)]
pub struct StreamingExit {
    pub status: ExitStatus,
    pub stderr: Vec<u8>,
    pub stderr_truncated: usize,
}

impl StreamingChild {
    /// Spawn `cmd` and hand back the line reader. `stdin` is written and closed on a
    /// background thread, so the child may produce output before it reads its input.
    #[instrument(skip_all, fields(stderr_limit_bytes))]
    pub fn spawn(mut cmd: Command, stdin: &[u8], stderr_limit_bytes: usize) -> Result<Self> {
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!("spawning streaming child process");
        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                error!(err = %e, "failed to spawn command");
                return Err(e).context("spawn command");
            }
        };

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;
        let stderr_handle = thread::spawn(move || read_stream_limited(stderr, stderr_limit_bytes));

        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let input = stdin.to_vec();
        let stdin_handle = thread::spawn(move || {
            // Dropping the handle at the end of the thread closes the pipe.
            child_stdin.write_all(&input).context("write stdin")
        });

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;

        Ok(Self {
            child,
            lines: BufReader::new(stdout).lines(),
            stdin_handle: Some(stdin_handle),
            stderr_handle: Some(stderr_handle),
            finished: false,
        })
    }

    /// Block until the next stdout line, or `None` at end of stream.
    pub fn next_line(&mut self) -> Option<Result<String>> {
        self.lines
            .next()
            .map(|line| line.context("read child stdout"))
    }

    /// Wait for the child to exit and collect its stderr.
    pub fn finish(&mut self) -> Result<StreamingExit> {
        let status = self.child.wait().context("wait for streaming child")?;
        self.finished = true;
        if let Some(handle) = self.stdin_handle.take() {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(err = %format!("{err:#}"), "child did not read all of stdin"),
                Err(_) => warn!("stdin writer thread panicked"),
            }
        }
        let (stderr, stderr_truncated) = match self.stderr_handle.take() {
            Some(handle) => join_output(handle).context("join stderr")?,
            None => (Vec::new(), 0),
        };
        debug!(exit_code = ?status.code(), "streaming child finished");
        Ok(StreamingExit {
            status,
            stderr,
            stderr_truncated,
        })
    }
}

impl Drop for StreamingChild {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!("abandoning streaming child, killing");
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
