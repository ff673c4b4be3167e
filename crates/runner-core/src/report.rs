//! Round report (`report.tsv`) written into the build directory.
//!
//! One row per build, listing, retry round, and session verdict.
//!
//! Columns: `timestamp_ms`, kind, session, attempt, `duration_ms`, `exit_code`,
//!          requested, failed, message

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use chrono::Utc;

/// A single row in the report.tsv file.
#[derive(Debug, Clone)]
pub struct ReportRow {
    /// Unix timestamp in milliseconds.
    pub timestamp_ms: i64,
    /// Row kind (`BUILD`, `LIST`, `ROUND`, `SESSION_PASSED`, `SESSION_FAILED`).
    pub kind: String,
    /// Session description, empty for build and listing rows.
    pub session: String,
    pub attempt: Option<u32>,
    pub duration_ms: Option<u64>,
    /// Exit code of the external tool, empty when it timed out.
    pub exit_code: Option<i32>,
    pub requested: Option<usize>,
    pub failed: Option<usize>,
    pub message: String,
}

impl ReportRow {
    /// Create a new report row with required fields.
    pub fn new(timestamp_ms: i64, kind: impl Into<String>) -> Self {
        Self {
            timestamp_ms,
            kind: kind.into(),
            session: String::new(),
            attempt: None,
            duration_ms: None,
            exit_code: None,
            requested: None,
            failed: None,
            message: String::new(),
        }
    }

    /// Create a row stamped with the current time.
    pub fn now(kind: impl Into<String>) -> Self {
        Self::new(Utc::now().timestamp_millis(), kind)
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = session.into();
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = Some(exit_code);
        self
    }

    /// Set requested and failed test counts.
    pub fn with_counts(mut self, requested: usize, failed: usize) -> Self {
        self.requested = Some(requested);
        self.failed = Some(failed);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Format as a TSV line.
    fn to_tsv_line(&self) -> String {
        let attempt = self.attempt.map(|a| a.to_string()).unwrap_or_default();
        let duration = self.duration_ms.map(|d| d.to_string()).unwrap_or_default();
        let exit_code = self.exit_code.map(|c| c.to_string()).unwrap_or_default();
        let requested = self.requested.map(|r| r.to_string()).unwrap_or_default();
        let failed = self.failed.map(|f| f.to_string()).unwrap_or_default();

        format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            self.timestamp_ms,
            self.kind,
            sanitize_field(&self.session),
            attempt,
            duration,
            exit_code,
            requested,
            failed,
            sanitize_field(&self.message),
        )
    }
}

/// Sanitize a field value to prevent TSV breakage.
fn sanitize_field(value: &str) -> String {
    value.replace(['\t', '\n', '\r'], " ")
}

/// TSV header row.
const HEADER: &str =
    "timestamp_ms\tkind\tsession\tattempt\tduration_ms\texit_code\trequested\tfailed\tmessage";

/// Writer for report.tsv files.
pub struct ReportWriter {
    writer: BufWriter<File>,
}

impl std::fmt::Debug for ReportWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportWriter")
            .field("writer", &"BufWriter<File>")
            .finish()
    }
}

impl ReportWriter {
    /// Create a new report writer, writing header if the file is new.
    pub fn new(path: &Path) -> std::io::Result<Self> {
        let exists = path.exists();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let mut writer = BufWriter::new(file);

        if !exists {
            writeln!(writer, "{HEADER}")?;
        }

        Ok(Self { writer })
    }

    /// Write a single row and flush it, so a killed run keeps its history.
    pub fn write_row(&mut self, row: &ReportRow) -> std::io::Result<()> {
        writeln!(self.writer, "{}", row.to_tsv_line())?;
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn round_row_to_tsv_line() {
        let row = ReportRow::new(1_443_111_111_000, "ROUND")
            .with_session("iPhone 5 / iOS 9.0")
            .with_attempt(2)
            .with_duration_ms(65_000)
            .with_exit_code(1)
            .with_counts(5, 2);

        assert_eq!(
            row.to_tsv_line(),
            "1443111111000\tROUND\tiPhone 5 / iOS 9.0\t2\t65000\t1\t5\t2\t"
        );
    }

    #[test]
    fn minimal_row_leaves_optional_columns_empty() {
        let row = ReportRow::new(1000, "LIST").with_message("12 tests");
        assert_eq!(row.to_tsv_line(), "1000\tLIST\t\t\t\t\t\t\t12 tests");
    }

    #[test]
    fn sanitize_field_removes_control_chars() {
        let sanitized = sanitize_field("line1\nline2\twith\ttabs\rcarriage");
        assert!(!sanitized.contains('\t'));
        assert!(!sanitized.contains('\n'));
        assert!(!sanitized.contains('\r'));
    }

    #[test]
    fn report_writer_creates_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("report.tsv");

        {
            let mut writer = ReportWriter::new(&path).unwrap();
            writer.write_row(&ReportRow::new(1000, "BUILD")).unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], HEADER);
        assert!(lines[1].starts_with("1000\tBUILD"));
    }

    #[test]
    fn report_writer_appends_without_duplicate_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("report.tsv");

        {
            let mut writer = ReportWriter::new(&path).unwrap();
            writer.write_row(&ReportRow::new(1000, "LIST")).unwrap();
        }
        {
            let mut writer = ReportWriter::new(&path).unwrap();
            writer.write_row(&ReportRow::new(2000, "ROUND")).unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], HEADER);
        assert!(lines[1].contains("LIST"));
        assert!(lines[2].contains("ROUND"));
    }

    #[test]
    fn now_stamps_current_time() {
        let before = Utc::now().timestamp_millis();
        let row = ReportRow::now("BUILD");
        assert!(row.timestamp_ms >= before);
    }
}
