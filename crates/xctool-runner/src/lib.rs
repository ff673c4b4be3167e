//! xctool-runner - builds and runs xctool test suites with hang detection,
//! retries of failed tests, and partitioning across runner instances.
//!
//! A run executes the requested actions in command-line order:
//! - `build`: build the test bundle once.
//! - `test`: list every test, select this instance's partition, then run it
//!   on each configured simulator session, retrying failures while progress
//!   is being made.

pub mod controller;
pub mod render;
pub mod supervisor;
pub mod xctool;

use controller::{remove_stale_stream, RetryController, SessionResult};
use runner_core::config::ConfigError;
use runner_core::events::{listed_tests, read_events, EventStreamError};
use runner_core::partition::{self, PartitionError};
use runner_core::{CaptureMode, Config, ReportRow, ReportWriter, TestIdentifier};
use supervisor::{run_script, Script, ScriptOutput, SupervisorConfig, SupervisorError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use xctool::{XcodeTarget, Xctool, XctoolExecutor};

/// Top-level command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Action {
    Build,
    Test,
}

/// An xctool invocation outside the retry rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Build,
    Listing,
}

impl Phase {
    fn verb(self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Listing => "list",
        }
    }

    fn gerund(self) -> &'static str {
        match self {
            Self::Build => "building",
            Self::Listing => "listing",
        }
    }

    fn report_kind(self) -> &'static str {
        match self {
            Self::Build => "BUILD",
            Self::Listing => "LIST",
        }
    }
}

/// Fatal outcomes of a run. The display text is what the user sees in the
/// closing banner.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Timed out {} tests", .phase.gerund())]
    TimedOut { phase: Phase },
    #[error("Failed to {} tests (exit code {exit_code})", .phase.verb())]
    ExternalToolNonZeroExit { phase: Phase, exit_code: i32 },
    #[error("Tests FAILED on {session} too many times without progress")]
    NoProgress { session: String, attempts: u32 },
    #[error("Interrupted")]
    Cancelled,
    #[error("Invalid partition: {0}")]
    InvalidPartition(#[from] PartitionError),
    #[error("Unreadable test event stream: {0}")]
    EventStream(#[from] EventStreamError),
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunError {
    /// Process exit status for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Cancelled => 130,
            _ => 1,
        }
    }
}

/// Append a row to the report if one is open. Failures only warn.
pub(crate) fn write_report_row(report: Option<&mut ReportWriter>, row: &ReportRow) {
    if let Some(report) = report {
        if let Err(err) = report.write_row(row) {
            warn!(kind = %row.kind, error = %err, "failed to write report row");
        }
    }
}

/// Owns one invocation of the runner.
#[derive(Debug)]
pub struct Orchestrator {
    config: Config,
    xctool: Xctool,
    supervisor: SupervisorConfig,
    cancel: CancellationToken,
    report: Option<ReportWriter>,
}

impl Orchestrator {
    pub fn new(config: Config, target: XcodeTarget, cancel: CancellationToken) -> Self {
        let xctool = Xctool::new(&config, target);
        let supervisor = SupervisorConfig::new(config.timeout_sec, config.capture);
        Self {
            config,
            xctool,
            supervisor,
            cancel,
            report: None,
        }
    }

    /// Replace the supervision settings derived from the config.
    pub fn with_supervisor(mut self, supervisor: SupervisorConfig) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run `actions` in order, stopping at the first failure.
    pub async fn run(&mut self, actions: &[Action]) -> Result<(), RunError> {
        std::fs::create_dir_all(&self.config.build_dir)?;
        self.open_report();

        for action in actions {
            match action {
                Action::Build => self.build().await?,
                Action::Test => {
                    self.test().await?;
                }
            }
        }
        Ok(())
    }

    fn open_report(&mut self) {
        if self.report.is_some() {
            return;
        }
        let path = self.config.report_path();
        match ReportWriter::new(&path) {
            Ok(writer) => self.report = Some(writer),
            Err(err) => warn!(path = %path.display(), error = %err, "report disabled"),
        }
    }

    pub async fn build(&mut self) -> Result<(), RunError> {
        render::print_banner("Building tests");
        let script = self.xctool.build_tests();
        self.run_phase(Phase::Build, &script).await?;
        Ok(())
    }

    /// List the target's full test inventory, in stream order.
    pub async fn list_tests(&mut self) -> Result<Vec<TestIdentifier>, RunError> {
        render::print_banner("Listing tests");
        let stream_path = self.config.stream_path();
        remove_stale_stream(&stream_path)?;

        let script = self.xctool.list_tests(&stream_path);
        self.run_phase(Phase::Listing, &script).await?;

        let tests = listed_tests(&read_events(&stream_path)?);
        render::print_banner("Got list of tests");
        info!(count = tests.len(), "listed tests");
        write_report_row(
            self.report.as_mut(),
            &ReportRow::now("LIST").with_message(format!("{} test(s)", tests.len())),
        );
        Ok(tests)
    }

    /// List, select this instance's partition, and run it on every session.
    pub async fn test(&mut self) -> Result<Vec<SessionResult>, RunError> {
        let sessions = self.config.sessions()?;
        let tests = self.list_tests().await?;

        let selected = partition::select(
            &tests,
            self.config.partition,
            self.config.partition_count,
        )?;
        render::print_inventory(&tests, selected);
        info!(
            partition = self.config.partition,
            partition_count = self.config.partition_count,
            selected = selected.len(),
            total = tests.len(),
            "selected partition"
        );

        let executor = XctoolExecutor::new(&self.xctool, &self.supervisor, &self.cancel);
        let mut controller =
            RetryController::new(executor, self.config.retries, self.config.stream_path());
        if let Some(report) = self.report.as_mut() {
            controller = controller.with_report(report);
        }
        controller.run_sessions(&sessions, selected).await
    }

    /// Run a build or listing invocation; any non-success is fatal.
    async fn run_phase(&mut self, phase: Phase, script: &Script) -> Result<ScriptOutput, RunError> {
        render::print_command(script);
        let output = match run_script(script, &self.supervisor, &self.cancel).await {
            Ok(output) => output,
            Err(SupervisorError::TimedOut(_)) => {
                write_report_row(
                    self.report.as_mut(),
                    &ReportRow::now(phase.report_kind()).with_message("timed out"),
                );
                return Err(RunError::TimedOut { phase });
            }
            Err(SupervisorError::Cancelled) => return Err(RunError::Cancelled),
            Err(err) => return Err(err.into()),
        };
        echo_plain_output(self.supervisor.capture, &output);

        info!(
            phase = phase.verb(),
            exit_code = output.exit_code,
            duration_ms = output.duration_ms,
            "xctool finished"
        );
        write_report_row(
            self.report.as_mut(),
            &ReportRow::now(phase.report_kind())
                .with_exit_code(output.exit_code)
                .with_duration_ms(output.duration_ms),
        );

        if output.exit_code != 0 {
            return Err(RunError::ExternalToolNonZeroExit {
                phase,
                exit_code: output.exit_code,
            });
        }
        Ok(output)
    }
}

/// In plain capture mode nothing reached the terminal while xctool ran.
pub(crate) fn echo_plain_output(capture: CaptureMode, output: &ScriptOutput) {
    if capture == CaptureMode::Plain {
        render::print_output(&output.output);
    }
}
