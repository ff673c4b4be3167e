//! Reader for xctool's `json-stream` reporter output.
//!
//! Each line of the stream is one JSON object with an `event` discriminator.
//! Only `begin-test` and `end-test` matter here; every other event kind is
//! decoded as [`TestEvent::Other`] and ignored by the helpers below.

use crate::types::TestIdentifier;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventStreamError {
    #[error("failed to read event stream: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed event on line {line}: {source}")]
    Malformed {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, EventStreamError>;

/// A decoded execution event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestEvent {
    BeginTest(TestIdentifier),
    EndTest {
        test: TestIdentifier,
        succeeded: bool,
    },
    Other,
}

/// Wire shape of a stream record. Unknown fields are ignored.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
enum WireEvent {
    #[serde(rename_all = "camelCase")]
    BeginTest {
        class_name: String,
        method_name: String,
    },
    #[serde(rename_all = "camelCase")]
    EndTest {
        class_name: String,
        method_name: String,
        succeeded: bool,
    },
    #[serde(other)]
    Other,
}

impl From<WireEvent> for TestEvent {
    fn from(event: WireEvent) -> Self {
        match event {
            WireEvent::BeginTest {
                class_name,
                method_name,
            } => Self::BeginTest(TestIdentifier::new(class_name, method_name)),
            WireEvent::EndTest {
                class_name,
                method_name,
                succeeded,
            } => Self::EndTest {
                test: TestIdentifier::new(class_name, method_name),
                succeeded,
            },
            WireEvent::Other => Self::Other,
        }
    }
}

/// Read all events from a stream file.
///
/// A missing file means the tool never got far enough to write anything
/// (for example it hung and was killed) and yields no events.
pub fn read_events(path: &Path) -> Result<Vec<TestEvent>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    parse_events(&content)
}

/// Decode newline-delimited events.
///
/// An undecodable final line with no trailing newline is a record cut off
/// by a killed process and is dropped. Any other bad line is an error.
pub fn parse_events(content: &str) -> Result<Vec<TestEvent>> {
    let unterminated = !content.is_empty() && !content.ends_with('\n');
    let lines: Vec<&str> = content.lines().collect();
    let last = lines.len().saturating_sub(1);

    let mut events = Vec::with_capacity(lines.len());
    for (idx, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match serde_json::from_str::<WireEvent>(trimmed) {
            Ok(event) => events.push(event.into()),
            Err(_) if unterminated && idx == last => break,
            Err(source) => {
                return Err(EventStreamError::Malformed {
                    line: idx + 1,
                    source,
                })
            }
        }
    }

    Ok(events)
}

/// Listing mode: every test announced by a `begin-test` event, in stream
/// order, each at most once.
pub fn listed_tests(events: &[TestEvent]) -> Vec<TestIdentifier> {
    let mut seen = HashSet::new();
    events
        .iter()
        .filter_map(|event| match event {
            TestEvent::BeginTest(test) if seen.insert(test.clone()) => Some(test.clone()),
            _ => None,
        })
        .collect()
}

/// Result mode: tests reported by an `end-test` event with `succeeded: true`.
pub fn succeeded_tests(events: &[TestEvent]) -> HashSet<TestIdentifier> {
    events
        .iter()
        .filter_map(|event| match event {
            TestEvent::EndTest {
                test,
                succeeded: true,
            } => Some(test.clone()),
            _ => None,
        })
        .collect()
}
