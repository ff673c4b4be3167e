//! xctool invocations.
//!
//! Commands are assembled as argument vectors and only rendered into shell
//! syntax (with quoting) by the supervisor, so workspace names, schemes and
//! device names containing spaces or quotes pass through untouched.

use crate::controller::RoundExecutor;
use crate::render;
use crate::supervisor::{run_script, Script, ScriptOutput, SupervisorConfig, SupervisorError};
use runner_core::{Config, Session, TestIdentifier};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// What to build and test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XcodeTarget {
    pub workspace: String,
    pub scheme: String,
    /// Test target name passed to `-only`.
    pub target: String,
}

/// Builder for xctool command lines.
#[derive(Debug, Clone)]
pub struct Xctool {
    path: PathBuf,
    sdk: String,
    build_dir: PathBuf,
    fresh_simulator: bool,
    reset_simulator: bool,
    target: XcodeTarget,
}

impl Xctool {
    pub fn new(config: &Config, target: XcodeTarget) -> Self {
        Self {
            path: config.xctool_path.clone(),
            sdk: config.sdk.clone(),
            build_dir: config.build_dir.clone(),
            fresh_simulator: config.fresh_simulator,
            reset_simulator: config.reset_simulator,
            target,
        }
    }

    pub fn target(&self) -> &XcodeTarget {
        &self.target
    }

    /// `xctool -workspace W -scheme S -sdk SDK [-destination D] <build settings>`
    fn base(&self, destination: Option<&str>) -> Script {
        let build_dir = self.build_dir.display().to_string();
        let mut script = Script::new(self.path.display().to_string())
            .args(["-workspace", self.target.workspace.as_str()])
            .args(["-scheme", self.target.scheme.as_str()])
            .args(["-sdk", self.sdk.as_str()]);
        if let Some(destination) = destination {
            script = script.args(["-destination", destination]);
        }
        script
            .arg(format!("CONFIGURATION_BUILD_DIR={build_dir}"))
            .arg(format!("-derivedDataPath={build_dir}"))
    }

    fn json_stream_reporter(stream_path: &Path) -> [String; 4] {
        [
            "-reporter".to_string(),
            "pretty".to_string(),
            "-reporter".to_string(),
            format!("json-stream:{}", stream_path.display()),
        ]
    }

    /// Build the test bundle without running it.
    pub fn build_tests(&self) -> Script {
        self.base(None)
            .arg("build-tests")
            .args(["-only", self.target.target.as_str()])
            .args(["-reporter", "pretty"])
    }

    /// Enumerate the target's tests into the json-stream without running them.
    pub fn list_tests(&self, stream_path: &Path) -> Script {
        self.base(None)
            .args(["run-tests", "-listTestsOnly"])
            .args(["-only", self.target.target.as_str()])
            .args(Self::json_stream_reporter(stream_path))
    }

    /// Run exactly `tests` on `destination`.
    pub fn run_tests(
        &self,
        destination: &str,
        tests: &[TestIdentifier],
        stream_path: &Path,
    ) -> Script {
        let mut script = self.base(Some(destination)).arg("run-tests");
        if self.fresh_simulator {
            script = script.arg("-freshSimulator");
        }
        if self.reset_simulator {
            script = script.arg("-resetSimulator");
        }

        let filter = tests
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        script
            .args(["-only".to_string(), format!("{}:{filter}", self.target.target)])
            .args(Self::json_stream_reporter(stream_path))
    }
}

/// Runs retry rounds through xctool under supervision.
#[derive(Debug)]
pub struct XctoolExecutor<'a> {
    xctool: &'a Xctool,
    supervisor: &'a SupervisorConfig,
    cancel: &'a CancellationToken,
}

impl<'a> XctoolExecutor<'a> {
    pub fn new(
        xctool: &'a Xctool,
        supervisor: &'a SupervisorConfig,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            xctool,
            supervisor,
            cancel,
        }
    }
}

impl RoundExecutor for XctoolExecutor<'_> {
    async fn run_round(
        &self,
        session: &Session,
        tests: &[TestIdentifier],
        stream_path: &Path,
    ) -> Result<ScriptOutput, SupervisorError> {
        let script = self
            .xctool
            .run_tests(&session.destination, tests, stream_path);
        render::print_command(&script);
        let output = run_script(&script, self.supervisor, self.cancel).await?;
        crate::echo_plain_output(self.supervisor.capture, &output);
        Ok(output)
    }
}
