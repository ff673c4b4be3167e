//! Retry state machine for one session.
//!
//! A session starts with its whole partition remaining at attempt 1. After
//! each round, the remaining set shrinks to the tests that did not report
//! success. Any shrinkage counts as progress and resets the attempt counter;
//! a round without progress spends one attempt. The session passes as soon
//! as nothing remains and fails once the attempt counter exceeds
//! `retries + 1`.

use crate::types::{SessionStatus, TestIdentifier};
use std::collections::HashSet;

/// Outcome of a single recorded round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundSummary {
    /// Attempt number the round ran as.
    pub attempt: u32,
    /// Number of tests requested in the round.
    pub requested: usize,
    /// Requested tests that did not report success, in request order.
    pub failed: Vec<TestIdentifier>,
    /// Whether at least one requested test newly succeeded.
    pub progressed: bool,
}

#[derive(Debug, Clone)]
pub struct RetryState {
    remaining: Vec<TestIdentifier>,
    attempt: u32,
    retries: u32,
    rounds: u32,
}

impl RetryState {
    pub fn new(tests: Vec<TestIdentifier>, retries: u32) -> Self {
        Self {
            remaining: tests,
            attempt: 1,
            retries,
            rounds: 0,
        }
    }

    pub fn remaining(&self) -> &[TestIdentifier] {
        &self.remaining
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Rounds recorded so far.
    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    /// Attempts allowed without progress before the session fails.
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// An empty remaining set passes regardless of the attempt counter.
    pub fn status(&self) -> SessionStatus {
        if self.remaining.is_empty() {
            SessionStatus::Passed
        } else if self.attempt > self.max_attempts() {
            SessionStatus::Failed
        } else {
            SessionStatus::Running
        }
    }

    /// Fold one round's successes into the state.
    ///
    /// Successes for tests outside the remaining set are ignored, so the new
    /// remaining set is always a subset of the old one.
    pub fn record_round(&mut self, succeeded: &HashSet<TestIdentifier>) -> RoundSummary {
        let attempt = self.attempt;
        let requested = self.remaining.len();

        let failed: Vec<TestIdentifier> = self
            .remaining
            .iter()
            .filter(|test| !succeeded.contains(*test))
            .cloned()
            .collect();

        let progressed = failed.len() < requested;
        if progressed {
            self.attempt = 1;
        } else {
            self.attempt += 1;
        }
        self.remaining.clone_from(&failed);
        self.rounds += 1;

        RoundSummary {
            attempt,
            requested,
            failed,
            progressed,
        }
    }
}
