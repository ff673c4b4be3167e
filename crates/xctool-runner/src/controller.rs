//! Retry controller.
//!
//! Drives each session through rounds of "run the remaining tests, keep the
//! ones that did not pass" until the session passes or stops making
//! progress. Sessions run one after another and share the build directory's
//! stream file, which is removed before every round so a previous round's
//! results can never be read as current.

use crate::render;
use crate::supervisor::{ScriptOutput, SupervisorError};
use crate::{write_report_row, RunError};
use runner_core::events::{read_events, succeeded_tests};
use runner_core::retry::RetryState;
use runner_core::{ReportRow, ReportWriter, Session, SessionStatus, TestIdentifier};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Runs one round of tests against a session, writing the json-stream
/// events to `stream_path`.
#[allow(async_fn_in_trait)]
pub trait RoundExecutor {
    async fn run_round(
        &self,
        session: &Session,
        tests: &[TestIdentifier],
        stream_path: &Path,
    ) -> Result<ScriptOutput, SupervisorError>;
}

impl<T: RoundExecutor> RoundExecutor for &T {
    async fn run_round(
        &self,
        session: &Session,
        tests: &[TestIdentifier],
        stream_path: &Path,
    ) -> Result<ScriptOutput, SupervisorError> {
        (**self).run_round(session, tests, stream_path).await
    }
}

/// Final state of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionResult {
    pub session: Session,
    pub status: SessionStatus,
    pub rounds: u32,
    /// Tests still failing when the session ended (empty when passed).
    pub failed: Vec<TestIdentifier>,
}

#[derive(Debug)]
pub struct RetryController<'a, E> {
    executor: E,
    retries: u32,
    stream_path: PathBuf,
    report: Option<&'a mut ReportWriter>,
}

/// Remove the previous round's stream file; absence is fine.
pub(crate) fn remove_stale_stream(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

impl<'a, E: RoundExecutor> RetryController<'a, E> {
    pub fn new(executor: E, retries: u32, stream_path: impl Into<PathBuf>) -> Self {
        Self {
            executor,
            retries,
            stream_path: stream_path.into(),
            report: None,
        }
    }

    pub fn with_report(mut self, report: &'a mut ReportWriter) -> Self {
        self.report = Some(report);
        self
    }

    /// Run every session in order, stopping at the first one that fails.
    pub async fn run_sessions(
        &mut self,
        sessions: &[Session],
        tests: &[TestIdentifier],
    ) -> Result<Vec<SessionResult>, RunError> {
        let mut results = Vec::with_capacity(sessions.len());
        for session in sessions {
            let result = self.run_session(session, tests).await?;
            if result.status == SessionStatus::Failed {
                return Err(RunError::NoProgress {
                    session: session.description.clone(),
                    attempts: self.retries.saturating_add(1),
                });
            }
            results.push(result);
        }

        render::print_banner("All tests PASSED on all devices");
        Ok(results)
    }

    /// Retry `tests` on one session until it passes or runs out of attempts.
    ///
    /// A round that hangs is not fatal: it counts as a round in which no
    /// requested test succeeded.
    pub async fn run_session(
        &mut self,
        session: &Session,
        tests: &[TestIdentifier],
    ) -> Result<SessionResult, RunError> {
        let mut state = RetryState::new(tests.to_vec(), self.retries);

        while state.status() == SessionStatus::Running {
            let attempt = state.attempt();
            let requested = state.remaining().len();

            render::print_banner(&format!(
                "Running {requested} test(s) on {} (attempt {attempt})",
                session.description
            ));
            render::print_requested(state.remaining());
            info!(
                session = %session.description,
                attempt,
                requested,
                "starting round"
            );

            remove_stale_stream(&self.stream_path)?;
            let outcome = self
                .executor
                .run_round(session, state.remaining(), &self.stream_path)
                .await;
            let completed = match outcome {
                Ok(output) => Some(output),
                Err(SupervisorError::TimedOut(timeout)) => {
                    render::print_banner("Timed out running tests");
                    warn!(
                        session = %session.description,
                        attempt,
                        timeout_sec = timeout.as_secs(),
                        "round timed out"
                    );
                    None
                }
                Err(SupervisorError::Cancelled) => return Err(RunError::Cancelled),
                Err(err) => return Err(err.into()),
            };

            let succeeded = if completed.is_some() {
                succeeded_tests(&read_events(&self.stream_path)?)
            } else {
                HashSet::new()
            };
            let summary = state.record_round(&succeeded);
            let failed = summary.failed.len();

            if failed > 0 {
                render::print_banner(&format!(
                    "{failed} of {requested} test(s) FAILED on {} (attempt {attempt})",
                    session.description
                ));
            }
            info!(
                session = %session.description,
                attempt,
                requested,
                failed,
                progressed = summary.progressed,
                "round finished"
            );

            let mut row = ReportRow::now("ROUND")
                .with_session(session.description.as_str())
                .with_attempt(attempt)
                .with_counts(requested, failed);
            match &completed {
                Some(output) => {
                    row = row
                        .with_exit_code(output.exit_code)
                        .with_duration_ms(output.duration_ms);
                }
                None => row = row.with_message("timed out"),
            }
            write_report_row(self.report.as_deref_mut(), &row);
        }

        let status = state.status();
        let kind = if status == SessionStatus::Passed {
            render::print_banner(&format!("Tests PASSED on {}", session.description));
            "SESSION_PASSED"
        } else {
            warn!(
                session = %session.description,
                rounds = state.rounds(),
                remaining = state.remaining().len(),
                "session made no progress within its retry budget"
            );
            "SESSION_FAILED"
        };
        write_report_row(
            self.report.as_deref_mut(),
            &ReportRow::now(kind)
                .with_session(session.description.as_str())
                .with_counts(tests.len(), state.remaining().len())
                .with_message(format!("{} round(s)", state.rounds())),
        );

        Ok(SessionResult {
            session: session.clone(),
            status,
            rounds: state.rounds(),
            failed: state.remaining().to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runner_core::partition;
    use std::cell::RefCell;
    use std::time::Duration;
    use tempfile::TempDir;

    /// What a fake round reports.
    struct Round {
        passed: Vec<TestIdentifier>,
        timed_out: bool,
    }

    impl Round {
        fn passing(passed: &[TestIdentifier]) -> Self {
            Self {
                passed: passed.to_vec(),
                timed_out: false,
            }
        }

        fn hang_after(passed: &[TestIdentifier]) -> Self {
            Self {
                passed: passed.to_vec(),
                timed_out: true,
            }
        }
    }

    /// Stands in for xctool: records what each round requested and writes a
    /// json-stream according to `behaviour(round_index, requested)`.
    struct FakeExecutor<F> {
        requests: RefCell<Vec<(String, Vec<TestIdentifier>)>>,
        behaviour: F,
    }

    impl<F> FakeExecutor<F>
    where
        F: Fn(usize, &[TestIdentifier]) -> Round,
    {
        fn new(behaviour: F) -> Self {
            Self {
                requests: RefCell::new(Vec::new()),
                behaviour,
            }
        }

        fn requested(&self) -> Vec<Vec<TestIdentifier>> {
            self.requests.borrow().iter().map(|(_, t)| t.clone()).collect()
        }
    }

    fn event(kind: &str, test: &TestIdentifier, succeeded: Option<bool>) -> String {
        let mut value = serde_json::json!({
            "event": kind,
            "className": test.class_name,
            "methodName": test.method_name,
        });
        if let Some(succeeded) = succeeded {
            value["succeeded"] = serde_json::Value::Bool(succeeded);
        }
        format!("{value}\n")
    }

    impl<F> RoundExecutor for FakeExecutor<F>
    where
        F: Fn(usize, &[TestIdentifier]) -> Round,
    {
        async fn run_round(
            &self,
            session: &Session,
            tests: &[TestIdentifier],
            stream_path: &Path,
        ) -> Result<ScriptOutput, SupervisorError> {
            let index = self.requests.borrow().len();
            self.requests
                .borrow_mut()
                .push((session.description.clone(), tests.to_vec()));
            let round = (self.behaviour)(index, tests);

            let mut stream = String::new();
            for test in tests {
                let passed = round.passed.contains(test);
                if round.timed_out && !passed {
                    continue;
                }
                stream.push_str(&event("begin-test", test, None));
                stream.push_str(&event("end-test", test, Some(passed)));
            }
            // Successes the round never asked for.
            for test in round.passed.iter().filter(|t| !tests.contains(t)) {
                stream.push_str(&event("end-test", test, Some(true)));
            }
            std::fs::write(stream_path, stream)?;

            if round.timed_out {
                return Err(SupervisorError::TimedOut(Duration::from_secs(120)));
            }
            let all_passed = tests.iter().all(|t| round.passed.contains(t));
            Ok(ScriptOutput {
                exit_code: i32::from(!all_passed),
                output: String::new(),
                duration_ms: 10,
            })
        }
    }

    fn suite(n: usize) -> Vec<TestIdentifier> {
        (0..n)
            .map(|i| TestIdentifier::new("SuiteTests", format!("test{i}")))
            .collect()
    }

    fn all_except(tests: &[TestIdentifier], failing: &[usize]) -> Vec<TestIdentifier> {
        tests
            .iter()
            .enumerate()
            .filter(|(i, _)| !failing.contains(i))
            .map(|(_, t)| t.clone())
            .collect()
    }

    fn iphone() -> Session {
        Session::ios_simulator("iPhone 5", "9.0")
    }

    #[tokio::test]
    async fn failed_tests_are_retried_until_they_pass() {
        let dir = TempDir::new().unwrap();
        let all = suite(10);
        let partition = partition::select(&all, 0, 2).unwrap();
        assert_eq!(partition, &all[0..5]);

        let first_round = all_except(partition, &[2, 4]);
        let executor = FakeExecutor::new(|round, requested: &[TestIdentifier]| match round {
            0 => Round::passing(&first_round),
            _ => Round::passing(requested),
        });
        let mut controller = RetryController::new(&executor, 4, dir.path().join("stream.json"));

        let result = controller.run_session(&iphone(), partition).await.unwrap();
        assert_eq!(result.status, SessionStatus::Passed);
        assert_eq!(result.rounds, 2);
        assert!(result.failed.is_empty());

        let requested = executor.requested();
        assert_eq!(requested[0], partition.to_vec());
        assert_eq!(requested[1], vec![all[2].clone(), all[4].clone()]);
    }

    #[tokio::test]
    async fn session_fails_after_retry_budget_without_progress() {
        let dir = TempDir::new().unwrap();
        let tests = suite(3);
        let executor = FakeExecutor::new(|_, _: &[TestIdentifier]| Round::passing(&[]));
        let mut controller = RetryController::new(&executor, 1, dir.path().join("stream.json"));

        let result = controller.run_session(&iphone(), &tests).await.unwrap();
        assert_eq!(result.status, SessionStatus::Failed);
        assert_eq!(result.rounds, 2);
        assert_eq!(result.failed, tests);
    }

    #[tokio::test]
    async fn progress_buys_more_attempts() {
        let dir = TempDir::new().unwrap();
        let tests = suite(3);
        // Every other round one more test passes; with retries=1 the session
        // would fail after two barren rounds, but progress keeps resetting it.
        let executor = FakeExecutor::new(|round, requested: &[TestIdentifier]| {
            if round % 2 == 1 {
                Round::passing(&requested[..1])
            } else {
                Round::passing(&[])
            }
        });
        let mut controller = RetryController::new(&executor, 1, dir.path().join("stream.json"));

        let result = controller.run_session(&iphone(), &tests).await.unwrap();
        assert_eq!(result.status, SessionStatus::Passed);
        assert_eq!(result.rounds, 6);
    }

    #[tokio::test]
    async fn hung_round_counts_every_requested_test_as_failed() {
        let dir = TempDir::new().unwrap();
        let tests = suite(4);
        let before_hang = tests[..1].to_vec();
        let executor = FakeExecutor::new(|round, requested: &[TestIdentifier]| match round {
            0 => Round::hang_after(&before_hang),
            _ => Round::passing(requested),
        });
        let mut controller = RetryController::new(&executor, 1, dir.path().join("stream.json"));

        let result = controller.run_session(&iphone(), &tests).await.unwrap();
        assert_eq!(result.status, SessionStatus::Passed);
        assert_eq!(result.rounds, 2);
        assert_eq!(executor.requested()[1], tests);
    }

    #[tokio::test]
    async fn hung_round_without_output_counts_everything_failed() {
        let dir = TempDir::new().unwrap();
        let tests = suite(2);
        let executor = FakeExecutor::new(|_, _: &[TestIdentifier]| Round::hang_after(&[]));
        let mut controller = RetryController::new(&executor, 2, dir.path().join("stream.json"));

        let result = controller.run_session(&iphone(), &tests).await.unwrap();
        assert_eq!(result.status, SessionStatus::Failed);
        assert_eq!(result.rounds, 3);
        assert!(executor.requested().iter().all(|r| *r == tests));
    }

    #[tokio::test]
    async fn successes_for_unrequested_tests_are_ignored() {
        let dir = TempDir::new().unwrap();
        let all = suite(4);
        let mine = all[..2].to_vec();
        let theirs = all[2..].to_vec();
        let executor = FakeExecutor::new(|_, _: &[TestIdentifier]| Round::passing(&theirs));
        let mut controller = RetryController::new(&executor, 0, dir.path().join("stream.json"));

        let result = controller.run_session(&iphone(), &mine).await.unwrap();
        assert_eq!(result.status, SessionStatus::Failed);
        assert_eq!(result.failed, mine);
    }

    #[tokio::test]
    async fn stale_stream_from_previous_round_is_not_reused() {
        struct SilentExecutor;

        impl RoundExecutor for SilentExecutor {
            async fn run_round(
                &self,
                _session: &Session,
                _tests: &[TestIdentifier],
                stream_path: &Path,
            ) -> Result<ScriptOutput, SupervisorError> {
                assert!(!stream_path.exists(), "stale stream left in place");
                Err(SupervisorError::TimedOut(Duration::from_secs(1)))
            }
        }

        let dir = TempDir::new().unwrap();
        let stream_path = dir.path().join("stream.json");
        let tests = suite(1);
        std::fs::write(&stream_path, event("end-test", &tests[0], Some(true))).unwrap();

        let mut controller = RetryController::new(SilentExecutor, 0, &stream_path);
        let result = controller.run_session(&iphone(), &tests).await.unwrap();
        assert_eq!(result.status, SessionStatus::Failed);
    }

    #[tokio::test]
    async fn empty_partition_passes_without_running() {
        let dir = TempDir::new().unwrap();
        let executor = FakeExecutor::new(|_, _: &[TestIdentifier]| Round::passing(&[]));
        let mut controller = RetryController::new(&executor, 4, dir.path().join("stream.json"));

        let result = controller.run_session(&iphone(), &[]).await.unwrap();
        assert_eq!(result.status, SessionStatus::Passed);
        assert_eq!(result.rounds, 0);
        assert!(executor.requested().is_empty());
    }

    #[tokio::test]
    async fn first_failing_session_stops_the_run() {
        let dir = TempDir::new().unwrap();
        let tests = suite(2);
        let sessions = vec![
            Session::ios_simulator("iPhone 5", "9.0"),
            Session::ios_simulator("iPad 2", "9.0"),
        ];
        let executor = FakeExecutor::new(|_, _: &[TestIdentifier]| Round::passing(&[]));
        let mut controller = RetryController::new(&executor, 0, dir.path().join("stream.json"));

        match controller.run_sessions(&sessions, &tests).await {
            Err(RunError::NoProgress { session, attempts }) => {
                assert_eq!(session, "iPhone 5 / iOS 9.0");
                assert_eq!(attempts, 1);
            }
            other => panic!("expected NoProgress, got {other:?}"),
        }

        let sessions_run: HashSet<String> = executor
            .requests
            .borrow()
            .iter()
            .map(|(s, _)| s.clone())
            .collect();
        assert_eq!(sessions_run.len(), 1);
    }

    #[tokio::test]
    async fn every_session_runs_the_whole_partition() {
        let dir = TempDir::new().unwrap();
        let tests = suite(3);
        let sessions = vec![
            Session::ios_simulator("iPhone 5", "9.0"),
            Session::ios_simulator("iPad 2", "9.0"),
        ];
        let executor = FakeExecutor::new(|_, requested: &[TestIdentifier]| Round::passing(requested));
        let mut controller = RetryController::new(&executor, 0, dir.path().join("stream.json"));

        let results = controller.run_sessions(&sessions, &tests).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.status == SessionStatus::Passed));

        let requests = executor.requests.borrow();
        assert_eq!(requests[0].0, "iPhone 5 / iOS 9.0");
        assert_eq!(requests[1].0, "iPad 2 / iOS 9.0");
        assert_eq!(requests[1].1, tests);
    }

    #[tokio::test]
    async fn cancellation_aborts_the_session() {
        struct CancelledExecutor;

        impl RoundExecutor for CancelledExecutor {
            async fn run_round(
                &self,
                _session: &Session,
                _tests: &[TestIdentifier],
                _stream_path: &Path,
            ) -> Result<ScriptOutput, SupervisorError> {
                Err(SupervisorError::Cancelled)
            }
        }

        let dir = TempDir::new().unwrap();
        let mut controller =
            RetryController::new(CancelledExecutor, 4, dir.path().join("stream.json"));
        let result = controller.run_session(&iphone(), &suite(1)).await;
        assert!(matches!(result, Err(RunError::Cancelled)));
    }

    #[tokio::test]
    async fn rounds_are_written_to_the_report() {
        let dir = TempDir::new().unwrap();
        let report_path = dir.path().join("report.tsv");
        let mut report = ReportWriter::new(&report_path).unwrap();
        let tests = suite(2);
        let executor = FakeExecutor::new(|round, requested: &[TestIdentifier]| match round {
            0 => Round::passing(&requested[..1]),
            _ => Round::passing(requested),
        });

        {
            let mut controller =
                RetryController::new(&executor, 4, dir.path().join("stream.json"))
                    .with_report(&mut report);
            controller.run_session(&iphone(), &tests).await.unwrap();
        }

        let content = std::fs::read_to_string(&report_path).unwrap();
        let kinds: Vec<&str> = content
            .lines()
            .skip(1)
            .map(|line| line.split('\t').nth(1).unwrap())
            .collect();
        assert_eq!(kinds, vec!["ROUND", "ROUND", "SESSION_PASSED"]);
        assert!(content.contains("\tiPhone 5 / iOS 9.0\t1\t10\t1\t2\t1\t"));
    }
}
