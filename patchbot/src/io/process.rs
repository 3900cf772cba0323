//! Helpers for running child processes with timeouts and bounded output.

use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Captured result of one child process invocation.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Quote a string for safe interpolation into an `sh -c` script.
pub fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Run `script` under `sh -c` in `workdir`, killing it after `timeout`.
///
/// stdout/stderr are drained on reader threads (bounded to `output_limit`
/// bytes each) so a chatty child can never deadlock on a full pipe.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs()))]
pub fn run_shell(
    workdir: &Path,
    script: &str,
    timeout: Duration,
    output_limit: usize,
) -> Result<ExecOutput> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(script).current_dir(workdir);
    run_command(cmd, None, timeout, output_limit)
}

/// Run a prepared command with a timeout and bounded output capture.
pub fn run_command(
    cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit: usize,
) -> Result<ExecOutput> {
    run_command_streaming(cmd, stdin, timeout, output_limit, &mut |_| {})
}

/// Run a prepared command, relaying each stdout line to `on_line` as it
/// arrives. The full (bounded) stdout is still returned in the output.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs()))]
pub fn run_command_streaming(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit: usize,
    on_line: &mut dyn FnMut(&str),
) -> Result<ExecOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = cmd.spawn().context("spawn command")?;

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        child_stdin.write_all(input).context("write stdin")?;
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let (line_tx, line_rx) = mpsc::channel::<String>();
    let stdout_handle = thread::spawn(move || read_lines_limited(stdout, output_limit, &line_tx));
    let stderr_handle = thread::spawn(move || read_limited(stderr, output_limit));

    // Lines are relayed on this thread; the deadline covers the whole run.
    let deadline = Instant::now() + timeout;
    let mut timed_out = false;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            timed_out = true;
            break;
        }
        match line_rx.recv_timeout(remaining) {
            Ok(line) => on_line(&line),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                timed_out = true;
                break;
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    let status = if timed_out {
        warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
        child.kill().context("kill command")?;
        child.wait().context("wait command after kill")?
    } else {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match child.wait_timeout(remaining).context("wait for command")? {
            Some(status) => status,
            None => {
                warn!("command still running after stdout closed, killing");
                timed_out = true;
                child.kill().context("kill command")?;
                child.wait().context("wait command after kill")?
            }
        }
    };

    let stdout = join_reader(stdout_handle).context("join stdout")?;
    let stderr = join_reader(stderr_handle).context("join stderr")?;
    let exit_code = status.code().unwrap_or(-1);
    debug!(exit_code, timed_out, "command finished");
    Ok(ExecOutput {
        exit_code,
        stdout,
        stderr,
        timed_out,
    })
}

fn join_reader(handle: thread::JoinHandle<Result<String>>) -> Result<String> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_lines_limited<R: Read>(
    reader: R,
    limit: usize,
    lines: &mpsc::Sender<String>,
) -> Result<String> {
    let mut buf_reader = BufReader::new(reader);
    let mut collected = String::new();
    let mut dropped = 0usize;
    loop {
        let mut line = Vec::new();
        let n = buf_reader
            .read_until(b'\n', &mut line)
            .context("read line")?;
        if n == 0 {
            break;
        }
        let text = String::from_utf8_lossy(&line).into_owned();
        // The receiver may have stopped listening after a timeout.
        let _ = lines.send(text.clone());
        if collected.len() + text.len() <= limit {
            collected.push_str(&text);
        } else {
            dropped += text.len();
        }
    }
    if dropped > 0 {
        warn!(dropped, "stdout truncated");
    }
    Ok(collected)
}

fn read_limited<R: Read>(mut reader: R, limit: usize) -> Result<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut dropped = 0usize;
    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            dropped += n - keep;
        } else {
            dropped += n;
        }
    }
    if dropped > 0 {
        warn!(dropped, "output truncated");
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
