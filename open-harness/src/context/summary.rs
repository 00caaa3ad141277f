//! Structured running summary, preserved across message eviction.
//!
//! Updated on every tool completion and rendered into the system layer so
//! the model does not re-discover workspace state after compression.

use std::collections::{BTreeSet, VecDeque};
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::message::{ToolCall, ToolResult};

/// Bound on the recent-error list.
const MAX_RECENT_ERRORS: usize = 5;
/// Bound on the stored test-output head.
const TEST_OUTPUT_HEAD: usize = 240;
/// Bound on one stored error line.
const ERROR_LINE_LIMIT: usize = 160;

static PASSED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) passed").expect("passed regex is valid"));
static FAILED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) failed").expect("failed regex is valid"));

/// Result of the most recent test run.
#[derive(Debug, Clone, Default)]
pub struct TestOutcome {
    /// Tests reported passed.
    pub passed: u32,
    /// Tests reported failed.
    pub failed: u32,
    /// Head of the test output.
    pub output_head: String,
}

/// The running goal summary.
#[derive(Debug, Clone, Default)]
pub struct StructuredSummary {
    files_modified: BTreeSet<String>,
    last_test_result: Option<TestOutcome>,
    recent_errors: VecDeque<String>,
}

impl StructuredSummary {
    /// Files modified so far.
    #[must_use]
    pub const fn files_modified(&self) -> &BTreeSet<String> {
        &self.files_modified
    }

    /// The most recent test outcome, when any tests ran.
    #[must_use]
    pub const fn last_test_result(&self) -> Option<&TestOutcome> {
        self.last_test_result.as_ref()
    }

    /// Fold one tool completion into the summary.
    pub fn update(&mut self, call: &ToolCall, result: &ToolResult) {
        match call.name.as_str() {
            "write_file" | "edit_file" if result.ok => {
                if let Some(path) = call.arguments.get("path").and_then(|v| v.as_str()) {
                    self.files_modified.insert(path.to_string());
                }
            }
            "run_tests" => {
                self.last_test_result = Some(parse_test_output(&result.payload));
            }
            _ => {}
        }
        if !result.ok {
            let line = one_line(&format!("{}: {}", call.name, result.payload), ERROR_LINE_LIMIT);
            self.recent_errors.push_back(line);
            while self.recent_errors.len() > MAX_RECENT_ERRORS {
                self.recent_errors.pop_front();
            }
        }
    }

    /// Drop modified-file entries the rollback removed from disk.
    pub fn prune_missing(&mut self, root: &Path) {
        self.files_modified.retain(|path| {
            let candidate = Path::new(path);
            if candidate.is_absolute() {
                candidate.exists()
            } else {
                root.join(candidate).exists()
            }
        });
    }

    /// Render the summary section of the system layer. Empty when there is
    /// nothing worth saying.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.files_modified.is_empty() {
            out.push_str("Files modified: ");
            let files: Vec<&str> = self.files_modified.iter().map(String::as_str).collect();
            out.push_str(&files.join(", "));
            out.push('\n');
        }
        if let Some(tests) = &self.last_test_result {
            out.push_str(&format!(
                "Last test run: {} passed, {} failed",
                tests.passed, tests.failed
            ));
            if !tests.output_head.is_empty() {
                out.push_str(&format!(" — {}", one_line(&tests.output_head, 100)));
            }
            out.push('\n');
        }
        if !self.recent_errors.is_empty() {
            out.push_str("Recent errors:\n");
            for error in &self.recent_errors {
                out.push_str("  - ");
                out.push_str(error);
                out.push('\n');
            }
        }
        out
    }
}

fn parse_test_output(payload: &str) -> TestOutcome {
    let passed = PASSED
        .captures(payload)
        .and_then(|c| c.get(1)?.as_str().parse().ok())
        .unwrap_or(0);
    let failed = FAILED
        .captures(payload)
        .and_then(|c| c.get(1)?.as_str().parse().ok())
        .unwrap_or(0);
    let output_head: String = payload.chars().take(TEST_OUTPUT_HEAD).collect();
    TestOutcome {
        passed,
        failed,
        output_head,
    }
}

fn one_line(text: &str, limit: usize) -> String {
    let flat: String = text
        .chars()
        .map(|c| if c == '\n' { ' ' } else { c })
        .take(limit)
        .collect();
    flat
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, Value};

    fn call(name: &str, path: Option<&str>) -> ToolCall {
        let mut args = Map::new();
        if let Some(path) = path {
            args.insert("path".into(), Value::String(path.into()));
        }
        ToolCall::new("c1", name, args)
    }

    fn ok_result(payload: &str) -> ToolResult {
        ToolResult {
            call_id: "c1".into(),
            ok: true,
            payload: payload.into(),
            elapsed_ms: 1,
            truncation_note: None,
        }
    }

    #[test]
    fn test_tracks_modified_files() {
        let mut summary = StructuredSummary::default();
        summary.update(&call("write_file", Some("src/a.rs")), &ok_result("wrote"));
        summary.update(&call("edit_file", Some("src/b.rs")), &ok_result("replaced"));
        summary.update(&call("read_file", Some("src/c.rs")), &ok_result("data"));
        let files: Vec<&String> = summary.files_modified().iter().collect();
        assert_eq!(files, ["src/a.rs", "src/b.rs"]);
    }

    #[test]
    fn test_parses_cargo_and_pytest_counts() {
        let mut summary = StructuredSummary::default();
        summary.update(
            &call("run_tests", None),
            &ok_result("test result: ok. 12 passed; 0 failed; finished"),
        );
        let tests = summary.last_test_result().unwrap();
        assert_eq!(tests.passed, 12);

        summary.update(&call("run_tests", None), &ok_result("3 passed, 2 failed in 0.5s"));
        let tests = summary.last_test_result().unwrap();
        assert_eq!((tests.passed, tests.failed), (3, 2));
    }

    #[test]
    fn test_recent_errors_are_bounded() {
        let mut summary = StructuredSummary::default();
        for i in 0..8 {
            let result = ToolResult {
                call_id: "c".into(),
                ok: false,
                payload: format!("error {i}"),
                elapsed_ms: 0,
                truncation_note: None,
            };
            summary.update(&call("shell", None), &result);
        }
        let rendered = summary.render();
        assert!(!rendered.contains("error 2"));
        assert!(rendered.contains("error 7"));
    }

    #[test]
    fn test_prune_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("kept.rs"), "x").unwrap();
        let mut summary = StructuredSummary::default();
        summary.update(&call("write_file", Some("kept.rs")), &ok_result("ok"));
        summary.update(&call("write_file", Some("gone.rs")), &ok_result("ok"));
        summary.prune_missing(dir.path());
        let files: Vec<&String> = summary.files_modified().iter().collect();
        assert_eq!(files, ["kept.rs"]);
    }

    #[test]
    fn test_empty_summary_renders_empty() {
        assert!(StructuredSummary::default().render().is_empty());
    }
}
