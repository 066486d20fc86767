//! Child processes for command nodes, token commands and external hashing.
//!
//! Every child runs with stdin closed, a wall-clock limit, and both pipes
//! drained on background threads so a chatty tool cannot block on a full pipe.

use std::io::Read;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Wall-clock and capture limits for one child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunLimits {
    pub timeout: Duration,
    /// Bytes kept per stream; the rest is read and dropped.
    pub capture_bytes: usize,
}

impl RunLimits {
    pub fn new(timeout: Duration, capture_bytes: usize) -> Self {
        Self {
            timeout,
            capture_bytes,
        }
    }
}

/// One drained pipe.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Captured {
    pub bytes: Vec<u8>,
    /// Bytes read past the capture limit.
    pub dropped: usize,
}

impl Captured {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    pub fn was_truncated(&self) -> bool {
        self.dropped > 0
    }
}

#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Captured,
    pub stderr: Captured,
    pub timed_out: bool,
    pub timeout: Duration,
}

impl CommandOutput {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    pub fn stdout_text(&self) -> String {
        self.stdout.text()
    }

    /// Last `max_lines` lines of stderr.
    pub fn stderr_tail(&self, max_lines: usize) -> String {
        let text = self.stderr.text();
        let lines: Vec<&str> = text.lines().collect();
        lines[lines.len().saturating_sub(max_lines)..].join("\n")
    }

    /// "`label` exited with status ...: <stderr tail>" or the timeout variant.
    pub fn failure_message(&self, label: &str) -> String {
        let head = if self.timed_out {
            format!("{label} timed out after {}s", self.timeout.as_secs())
        } else {
            match self.status.code() {
                Some(code) => format!("{label} exited with status {code}"),
                None => format!("{label} was terminated by a signal"),
            }
        };
        let tail = self.stderr_tail(20);
        match tail.trim() {
            "" => head,
            tail => format!("{head}: {tail}"),
        }
    }
}

/// `argv[0]` with the remaining arguments, run from `workdir`.
pub fn command_from_argv(argv: &[String], workdir: &Path) -> Result<Command> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("empty command"))?;
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(workdir);
    Ok(cmd)
}

/// Run `cmd` to completion (or until the timeout kills it).
///
/// A non-zero exit is not an error here; callers inspect
/// [`CommandOutput::succeeded`]. Spawn and I/O failures are.
#[instrument(skip_all, fields(program = ?cmd.get_program(), timeout_secs = limits.timeout.as_secs()))]
pub fn run_captured(mut cmd: Command, limits: RunLimits) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn {:?}", cmd.get_program()))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout = drain(stdout, limits.capture_bytes);
    let stderr = drain(stderr, limits.capture_bytes);

    let (status, timed_out) = match child.wait_timeout(limits.timeout).context("wait for child")? {
        Some(status) => (status, false),
        None => {
            warn!("child timed out, killing");
            child.kill().context("kill child")?;
            (child.wait().context("reap killed child")?, true)
        }
    };

    let stdout = collect(stdout).context("read stdout")?;
    let stderr = collect(stderr).context("read stderr")?;
    if stdout.was_truncated() || stderr.was_truncated() {
        warn!(
            stdout_dropped = stdout.dropped,
            stderr_dropped = stderr.dropped,
            "child output truncated"
        );
    }
    debug!(exit_code = ?status.code(), timed_out, "child finished");

    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        timed_out,
        timeout: limits.timeout,
    })
}

fn drain<R: Read + Send + 'static>(mut reader: R, limit: usize) -> JoinHandle<Result<Captured>> {
    thread::spawn(move || {
        let mut captured = Captured::default();
        let mut chunk = [0u8; 8192];
        loop {
            let n = reader.read(&mut chunk)?;
            if n == 0 {
                return Ok(captured);
            }
            let keep = n.min(limit.saturating_sub(captured.bytes.len()));
            captured.bytes.extend_from_slice(&chunk[..keep]);
            captured.dropped += n - keep;
        }
    })
}

fn collect(handle: JoinHandle<Result<Captured>>) -> Result<Captured> {
    handle
        .join()
        .map_err(|_| anyhow!("pipe reader thread panicked"))?
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    fn limits(timeout: Duration, capture_bytes: usize) -> RunLimits {
        RunLimits::new(timeout, capture_bytes)
    }

    #[test]
    fn captures_stdout_and_exit_status() {
        let output =
            run_captured(sh("echo hello"), limits(Duration::from_secs(5), 1024)).expect("run");
        assert!(output.succeeded());
        assert_eq!(output.stdout_text().trim(), "hello");
    }

    #[test]
    fn bounds_captured_output() {
        let output = run_captured(
            sh("printf 'abcdefghij'"),
            limits(Duration::from_secs(5), 4),
        )
        .expect("run");
        assert_eq!(output.stdout.bytes, b"abcd");
        assert_eq!(output.stdout.dropped, 6);
    }

    #[test]
    fn kills_on_timeout() {
        let output = run_captured(sh("sleep 5"), limits(Duration::from_millis(100), 1024))
            .expect("run");
        assert!(output.timed_out);
        assert!(!output.succeeded());
        assert!(output.failure_message("sleeper").contains("timed out"));
    }

    #[test]
    fn failure_message_carries_exit_code_and_stderr_tail() {
        let output = run_captured(
            sh("printf 'one\\ntwo\\nthree\\n' >&2; exit 3"),
            limits(Duration::from_secs(5), 1024),
        )
        .expect("run");
        assert!(!output.succeeded());
        assert_eq!(output.stderr_tail(2), "two\nthree");
        assert_eq!(
            output.failure_message("tool"),
            "tool exited with status 3: one\ntwo\nthree"
        );
    }

    #[test]
    fn empty_argv_is_rejected() {
        assert!(command_from_argv(&[], Path::new(".")).is_err());
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let cmd = Command::new("definitely-not-a-real-program-4f1c");
        assert!(run_captured(cmd, limits(Duration::from_secs(1), 16)).is_err());
    }
}
