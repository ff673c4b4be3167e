//! Core types shared by the runner and its CLI.

use thiserror::Error;

/// A single test case, addressed the way xctool's `-only` filter does.
///
/// Equality and hashing are structural so the retry loop can use plain
/// set operations on identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TestIdentifier {
    pub class_name: String,
    pub method_name: String,
}

impl TestIdentifier {
    pub fn new(class_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            method_name: method_name.into(),
        }
    }

    /// Dotted form used in human-readable listings (`Class.method`).
    pub fn dotted(&self) -> String {
        format!("{}.{}", self.class_name, self.method_name)
    }
}

/// Slash form (`Class/method`) accepted by `-only <target>:<tests>`.
impl std::fmt::Display for TestIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.class_name, self.method_name)
    }
}

// --- Enumerations ---

/// How the supervised process's terminal output is captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureMode {
    /// Run under `script(1)` so the output file receives the byte stream a
    /// terminal would see, progress output and control sequences included.
    #[default]
    Pty,
    /// Redirect stdout and stderr straight into the output file.
    Plain,
}

impl CaptureMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pty => "pty",
            Self::Plain => "plain",
        }
    }
}

impl std::str::FromStr for CaptureMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pty" => Ok(Self::Pty),
            "plain" => Ok(Self::Plain),
            _ => Err(format!("capture must be 'pty' or 'plain', got '{s}'")),
        }
    }
}

/// Terminal state of one session's retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Running,
    Passed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Passed => "PASSED",
            Self::Failed => "FAILED",
        }
    }
}

// --- Sessions ---

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionSpecError {
    #[error("device spec is empty")]
    Empty,
    #[error("invalid device spec '{0}': expected '<name>,<os version>'")]
    MissingVersion(String),
}

/// One simulated device the partition is run against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Opaque value handed to `-destination`.
    pub destination: String,
    /// Human-readable label used in banners.
    pub description: String,
    pub name: String,
    pub os_version: String,
}

impl Session {
    /// An iOS Simulator session for the given device name and OS version.
    pub fn ios_simulator(name: &str, os_version: &str) -> Self {
        Self {
            destination: format!("platform=iOS Simulator,OS={os_version},name={name}"),
            description: format!("{name} / iOS {os_version}"),
            name: name.to_string(),
            os_version: os_version.to_string(),
        }
    }
}

/// Parse a device list such as `iPhone 5,9.0;iPad 2,9.0`.
///
/// Segments are separated by `;`, and each segment splits on its first `,`
/// into device name and OS version. Order is preserved.
pub fn parse_sessions(spec: &str) -> Result<Vec<Session>, SessionSpecError> {
    let mut sessions = Vec::new();
    for segment in spec.split(';') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        let Some((name, version)) = segment.split_once(',') else {
            return Err(SessionSpecError::MissingVersion(segment.to_string()));
        };
        sessions.push(Session::ios_simulator(name.trim(), version.trim()));
    }

    if sessions.is_empty() {
        return Err(SessionSpecError::Empty);
    }
    Ok(sessions)
}
