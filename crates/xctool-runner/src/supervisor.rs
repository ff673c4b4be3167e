//! Supervised execution of external commands with an output-activity timeout.
//!
//! A run is considered hung when its output stops growing, not when it has
//! been running for long: xctool builds and test runs legitimately take far
//! longer than any fixed limit while they keep printing progress.
//!
//! Each invocation owns:
//! - a temporary shell script holding the command line
//! - a temporary output file receiving interleaved stdout/stderr
//! - a liveness deadline pushed forward whenever the output file grows
//!
//! Both temporary files are removed when the invocation returns, whatever
//! the outcome.

use regex::Regex;
use runner_core::CaptureMode;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;
use tempfile::{NamedTempFile, TempPath};
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often the output file size is checked.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Interval between "still running" log lines for long invocations.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Time a terminated process group gets to exit after SIGTERM before SIGKILL.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Terminal escape sequences: ESC up to and including the next `m`.
static ESCAPE_SEQUENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("\x1b[^m]*m").expect("escape sequence pattern is valid"));

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no output for {} seconds", .0.as_secs())]
    TimedOut(Duration),
    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Quote a word for a POSIX shell.
///
/// Words made only of characters the shell never interprets are left bare
/// so printed command lines stay readable.
pub fn shell_escape(word: &str) -> String {
    let is_safe = |c: char| c.is_ascii_alphanumeric() || "_-./:=,+@%".contains(c);
    if !word.is_empty() && word.chars().all(is_safe) {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', "'\\''"))
    }
}

/// Remove terminal escape sequences, leaving every other byte in order.
pub fn strip_escape_codes(output: &str) -> String {
    ESCAPE_SEQUENCE.replace_all(output, "").into_owned()
}

/// Drop the header and trailer util-linux `script(1)` writes into its log
/// file even with `-q`. BSD `script` writes neither.
fn strip_script_log_frame(log: &str) -> &str {
    let mut body = log;
    if body.starts_with("Script started on ") {
        body = body.split_once('\n').map_or("", |(_, rest)| rest);
    }
    if body.starts_with("Script done on ") {
        return "";
    }
    match body.rfind("\nScript done on ") {
        Some(end) => &body[..end],
        None => body,
    }
}

/// A command to run, kept as an argument vector until it is written out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    argv: Vec<String>,
}

impl Script {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            argv: vec![program.into()],
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// The command as a single shell-safe line.
    pub fn command_line(&self) -> String {
        self.argv
            .iter()
            .map(|word| shell_escape(word))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn body(&self) -> String {
        format!("#!/bin/sh\nexec {}\n", self.command_line())
    }
}

/// Supervisor settings for one invocation.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Maximum silence before the run is declared hung.
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub capture: CaptureMode,
    /// Directory for the temporary script and output files (system temp dir
    /// when unset).
    pub artifact_dir: Option<PathBuf>,
}

impl SupervisorConfig {
    pub fn new(timeout_sec: u32, capture: CaptureMode) -> Self {
        Self {
            timeout: Duration::from_secs(u64::from(timeout_sec)),
            poll_interval: POLL_INTERVAL,
            capture,
            artifact_dir: None,
        }
    }

    fn temp_builder(&self, suffix: &str) -> Result<NamedTempFile> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("xctool-runner-").suffix(suffix);
        let file = match &self.artifact_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        Ok(file)
    }
}

/// Result of a completed invocation.
#[derive(Debug, Clone)]
pub struct ScriptOutput {
    /// Exit code, or -1 when the process was ended by a signal.
    pub exit_code: i32,
    /// Captured output with escape sequences removed.
    pub output: String,
    pub duration_ms: u64,
}

/// How the wait loop ended.
enum ProcessOutcome {
    Completed(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

/// Run `script` until it exits, goes silent for `config.timeout`, or
/// `cancel` fires.
pub async fn run_script(
    script: &Script,
    config: &SupervisorConfig,
    cancel: &CancellationToken,
) -> Result<ScriptOutput> {
    let started = Instant::now();

    let script_path = write_script(script, config)?;
    let output_file = config.temp_builder(".log")?;
    let output_path = output_file.path().to_path_buf();

    let mut cmd = build_command(config.capture, &script_path, &output_file)?;
    cmd.stdin(Stdio::piped()).kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    debug!(
        capture = config.capture.as_str(),
        script = %script_path.display(),
        output = %output_path.display(),
        "spawning supervised process"
    );
    let mut child = cmd.spawn()?;

    let outcome = supervise(&mut child, &output_path, config, cancel).await?;

    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    match outcome {
        ProcessOutcome::TimedOut => {
            warn!(
                timeout_sec = config.timeout.as_secs(),
                duration_ms, "no output within timeout; terminating"
            );
            terminate(&mut child).await;
            Err(SupervisorError::TimedOut(config.timeout))
        }
        ProcessOutcome::Cancelled => {
            info!(duration_ms, "cancellation requested; terminating");
            terminate(&mut child).await;
            Err(SupervisorError::Cancelled)
        }
        ProcessOutcome::Completed(status) => {
            let exit_code = status.code().unwrap_or(-1);
            let raw = std::fs::read(&output_path)?;
            let text = String::from_utf8_lossy(&raw);
            let text: &str = match config.capture {
                CaptureMode::Pty => strip_script_log_frame(&text),
                CaptureMode::Plain => &text,
            };
            let output = strip_escape_codes(text);

            debug!(
                exit_code,
                duration_ms,
                output_bytes = output.len(),
                "supervised process exited"
            );
            Ok(ScriptOutput {
                exit_code,
                output,
                duration_ms,
            })
        }
    }
}

/// Write the script to a closed, executable temp file.
///
/// The write handle is closed before anything executes the file.
fn write_script(script: &Script, config: &SupervisorConfig) -> Result<TempPath> {
    let mut file = config.temp_builder(".sh")?;
    file.write_all(script.body().as_bytes())?;
    file.flush()?;
    let path = file.into_temp_path();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))?;
    }

    Ok(path)
}

fn build_command(
    capture: CaptureMode,
    script_path: &Path,
    output_file: &NamedTempFile,
) -> Result<Command> {
    match capture {
        CaptureMode::Plain => {
            let stdout = output_file.reopen()?;
            let stderr = stdout.try_clone()?;
            let mut cmd = Command::new("/bin/sh");
            cmd.arg(script_path)
                .stdout(Stdio::from(stdout))
                .stderr(Stdio::from(stderr));
            Ok(cmd)
        }
        CaptureMode::Pty => Ok(pty_command(script_path, output_file.path())),
    }
}

/// `script(1)` records the pty stream into the output file while still
/// echoing it to our stdout.
#[cfg(target_os = "macos")]
fn pty_command(script_path: &Path, output_path: &Path) -> Command {
    let mut cmd = Command::new("script");
    cmd.arg("-q")
        .arg("-t")
        .arg("0")
        .arg(output_path)
        .arg("/bin/sh")
        .arg(script_path);
    cmd
}

#[cfg(not(target_os = "macos"))]
fn pty_command(script_path: &Path, output_path: &Path) -> Command {
    let mut cmd = Command::new("script");
    cmd.arg("-q")
        .arg("-f")
        .arg("-e")
        .arg("-c")
        .arg(format!(
            "/bin/sh {}",
            shell_escape(&script_path.display().to_string())
        ))
        .arg(output_path);
    cmd
}

fn output_size(path: &Path) -> u64 {
    std::fs::metadata(path).map_or(0, |meta| meta.len())
}

/// Wait for the child while enforcing the liveness deadline.
async fn supervise(
    child: &mut Child,
    output_path: &Path,
    config: &SupervisorConfig,
    cancel: &CancellationToken,
) -> Result<ProcessOutcome> {
    let started = Instant::now();
    let mut deadline = started + config.timeout;
    let mut next_heartbeat = started + HEARTBEAT_INTERVAL;
    let mut last_size = output_size(output_path);

    loop {
        tokio::select! {
            status = child.wait() => return Ok(ProcessOutcome::Completed(status?)),
            () = cancel.cancelled() => return Ok(ProcessOutcome::Cancelled),
            () = tokio::time::sleep(config.poll_interval) => {
                let now = Instant::now();
                let size = output_size(output_path);
                if size != last_size {
                    last_size = size;
                    deadline = now + config.timeout;
                } else if now >= deadline {
                    return Ok(ProcessOutcome::TimedOut);
                }

                if now >= next_heartbeat {
                    next_heartbeat = now + HEARTBEAT_INTERVAL;
                    info!(
                        elapsed_sec = (now - started).as_secs(),
                        output_bytes = size,
                        "supervised process still running"
                    );
                }
            }
        }
    }
}

/// Stop the child and everything in its process group.
///
/// Closing stdin comes first, which lets `script(1)` hang up its pty. The
/// group then gets SIGTERM, a short grace period, and SIGKILL for anything
/// left over.
async fn terminate(child: &mut Child) {
    let pid = child.id();
    drop(child.stdin.take());

    signal_group(pid, GroupSignal::Terminate);
    let exited = tokio::time::timeout(TERMINATE_GRACE, child.wait())
        .await
        .is_ok();
    signal_group(pid, GroupSignal::Kill);

    if !exited {
        if let Err(err) = child.kill().await {
            warn!(error = %err, "failed to kill supervised process");
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: GroupSignal) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(raw) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    let signal = match signal {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    // ESRCH just means the group is already gone.
    if let Err(err) = killpg(Pid::from_raw(raw), signal) {
        debug!(pgid = raw, ?signal, error = %err, "killpg failed");
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: GroupSignal) {}
