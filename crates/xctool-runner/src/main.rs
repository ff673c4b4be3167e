//! xctool-runner command-line entry point.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::Parser;
use eyre::WrapErr;
use runner_core::config::DEFAULT_CONFIG_PATH;
use runner_core::{CaptureMode, Config};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};
use xctool_runner::xctool::XcodeTarget;
use xctool_runner::{render, Action, Orchestrator};

/// Exit status for unusable configuration, matching clap's usage errors.
const CONFIG_ERROR_EXIT: u8 = 2;

#[derive(Parser)]
#[command(
    name = "xctool-runner",
    about = "Build and run xctool test suites with hang detection, retries and partitioning",
    version
)]
struct Cli {
    /// Actions to perform, in order
    #[arg(value_enum, required = true)]
    actions: Vec<Action>,

    /// Workspace to build and test
    #[arg(long)]
    workspace: String,

    /// Scheme to build and test
    #[arg(long)]
    scheme: String,

    /// Test target
    #[arg(long)]
    target: String,

    /// Maximum number of times to retry a set of tests without progress
    #[arg(long)]
    retries: Option<u32>,

    /// Seconds to wait without output before failing an xctool run
    #[arg(long)]
    timeout: Option<u32>,

    /// Partition index to run
    #[arg(long)]
    partition: Option<usize>,

    /// Total number of partitions
    #[arg(long)]
    partition_count: Option<usize>,

    /// Simulators as `<name>,<os version>` pairs separated by `;`
    #[arg(long)]
    devices: Option<String>,

    /// Config file applied on top of .xctool-runner/config
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to the xctool executable
    #[arg(long)]
    xctool_path: Option<PathBuf>,

    /// Build directory for products, derived data and the event stream
    #[arg(long)]
    build_dir: Option<PathBuf>,

    /// SDK to build against
    #[arg(long)]
    sdk: Option<String>,

    /// Output capture mode: pty or plain
    #[arg(long)]
    capture: Option<CaptureMode>,

    /// Reuse the existing simulator instead of starting a fresh one
    #[arg(long)]
    no_fresh_simulator: bool,

    /// Keep simulator contents between runs
    #[arg(long)]
    no_reset_simulator: bool,
}

impl Cli {
    /// Defaults, then the working directory's config file, then `--config`,
    /// then flags.
    fn load_config(&self, working_dir: &Path) -> eyre::Result<Config> {
        let mut config = Config::default();

        let default_path = working_dir.join(DEFAULT_CONFIG_PATH);
        if default_path.exists() {
            config
                .load_file(&default_path)
                .wrap_err_with(|| format!("failed to load {}", default_path.display()))?;
        }
        if let Some(path) = &self.config {
            config
                .load_file(path)
                .wrap_err_with(|| format!("failed to load {}", path.display()))?;
        }

        if let Some(retries) = self.retries {
            config.retries = retries;
        }
        if let Some(timeout) = self.timeout {
            config.timeout_sec = timeout;
        }
        if let Some(partition) = self.partition {
            config.partition = partition;
        }
        if let Some(partition_count) = self.partition_count {
            config.partition_count = partition_count;
        }
        if let Some(devices) = &self.devices {
            config.devices.clone_from(devices);
        }
        if let Some(xctool_path) = &self.xctool_path {
            config.xctool_path.clone_from(xctool_path);
        }
        if let Some(build_dir) = &self.build_dir {
            config.build_dir.clone_from(build_dir);
        }
        if let Some(sdk) = &self.sdk {
            config.sdk.clone_from(sdk);
        }
        if let Some(capture) = self.capture {
            config.capture = capture;
        }
        if self.no_fresh_simulator {
            config.fresh_simulator = false;
        }
        if self.no_reset_simulator {
            config.reset_simulator = false;
        }

        config.resolve_paths(working_dir);
        config.validate()?;
        Ok(config)
    }

    fn xcode_target(&self) -> XcodeTarget {
        XcodeTarget {
            workspace: self.workspace.clone(),
            scheme: self.scheme.clone(),
            target: self.target.clone(),
        }
    }
}

fn setup(cli: &Cli) -> eyre::Result<Config> {
    let working_dir = std::env::current_dir().wrap_err("failed to determine working directory")?;
    cli.load_config(&working_dir)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries banners and xctool output.
    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match setup(&cli) {
        Ok(config) => config,
        Err(err) => {
            render::print_banner(&format!("{err:#}"));
            error!(error = %format!("{err:#}"), "invalid configuration");
            return ExitCode::from(CONFIG_ERROR_EXIT);
        }
    };
    info!(
        build_dir = %config.build_dir.display(),
        retries = config.retries,
        timeout_sec = config.timeout_sec,
        capture = config.capture.as_str(),
        "starting"
    );

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "failed to create tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    let result = runtime.block_on(async {
        let interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received interrupt, stopping");
                interrupt.cancel();
            }
        });

        let mut orchestrator = Orchestrator::new(config, cli.xcode_target(), cancel);
        orchestrator.run(&cli.actions).await
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            render::print_banner(&err.to_string());
            error!(error = %err, "run failed");
            ExitCode::from(err.exit_code())
        }
    }
}
