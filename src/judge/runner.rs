use crate::config::types::{LauncherError, Result, RunResult};
use crate::judge::registry::harness_for;
use crate::launcher::Launcher;
use crate::safety::workspace::WorkspaceManager;
use serde::{Deserialize, Serialize};

const TIME_MARKER: &str = "TIME_MS=";

/// One input/expected-output pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    /// JSON array of arguments, fed on stdin
    pub input: String,
    pub output: String,
}

/// Test case file: `{"testCases": [...], "hiddenTestCases": [...]}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSuite {
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
    #[serde(default)]
    pub hidden_test_cases: Vec<TestCase>,
}

/// Answer line and in-harness timing parsed from stdout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessOutput {
    pub answer: String,
    pub time_ms: u64,
}

/// First line is the answer; `TIME_MS=<n>` anywhere gives the timing (0 when absent).
pub fn parse_output(stdout: &str) -> HarnessOutput {
    let trimmed = stdout.trim();
    let answer = trimmed.lines().next().unwrap_or("").trim_end().to_string();
    let time_ms = trimmed
        .lines()
        .find_map(|line| line.trim().strip_prefix(TIME_MARKER))
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(0);
    HarnessOutput { answer, time_ms }
}

pub fn outputs_match(actual: &str, expected: &str) -> bool {
    actual.trim() == expected.trim()
}

/// A finished submission run
#[derive(Debug, Clone)]
pub struct Execution {
    pub output: HarnessOutput,
    pub result: RunResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseReport {
    pub input: String,
    pub expected: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    #[serde(rename = "Accepted")]
    Accepted,
    #[serde(rename = "Wrong Answer")]
    WrongAnswer,
    #[serde(rename = "Time Limit Exceeded")]
    TimeLimitExceeded,
    #[serde(rename = "Runtime Error")]
    RuntimeError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionOutcome {
    pub status: Verdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    /// Index of the first failing hidden case
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_case: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl SubmissionOutcome {
    fn failed(status: Verdict, case: usize, detail: Option<String>) -> Self {
        Self {
            status,
            time_ms: None,
            memory_mb: None,
            failed_case: Some(case),
            detail,
        }
    }
}

/// Human-readable failure, with the program's stderr when it has one.
fn describe(err: &LauncherError) -> String {
    match err {
        LauncherError::NonZeroExit { stderr, .. } if !stderr.trim().is_empty() => {
            format!("{}\n{}", err, stderr.trim())
        }
        _ => err.to_string(),
    }
}

/// Errors that mean the submission itself is unusable rather than wrong
fn is_caller_error(err: &LauncherError) -> bool {
    matches!(
        err,
        LauncherError::UnsupportedRuntime(_)
            | LauncherError::InvalidRequest(_)
            | LauncherError::Config(_)
            | LauncherError::Privilege(_)
    )
}

/// Runs submissions against test cases through a [`Launcher`].
pub struct Judge<'a> {
    launcher: &'a Launcher,
    workspaces: WorkspaceManager,
}

impl<'a> Judge<'a> {
    pub fn new(launcher: &'a Launcher, workspaces: WorkspaceManager) -> Self {
        Self {
            launcher,
            workspaces,
        }
    }

    /// Wrap `code`, run it once with `input` on stdin and parse the harness output.
    pub fn execute(&self, language: &str, code: &str, input: &str) -> Result<Execution> {
        let harness = harness_for(language)?;
        let workdir = self.launcher.defaults().workdir.clone();

        let mut workspace = self.workspaces.create_workspace()?;
        workspace.write_file(harness.source_file(), harness.wrap(code).as_bytes())?;

        let argv = harness.run_command(&workdir);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| LauncherError::InternalError("harness produced no command".into()))?;
        let request = self
            .launcher
            .request(harness.runtime_id(), program)
            .args(args.iter().cloned())
            .stdin(input)
            .mount(workspace.mount(&workdir))
            .build()?;

        log::debug!(
            "Executing {} submission in workspace {}",
            harness.runtime_id(),
            workspace.run_id()
        );
        let outcome = self.launcher.run(request);
        if let Err(e) = workspace.cleanup() {
            log::warn!("{}", e);
        }

        let result = outcome?;
        let output = parse_output(&result.stdout);
        let result = result.into_result()?;
        Ok(Execution { output, result })
    }

    /// Run every visible case and report each one.
    pub fn run_cases(&self, language: &str, code: &str, cases: &[TestCase]) -> Vec<CaseReport> {
        cases
            .iter()
            .map(|case| match self.execute(language, code, &case.input) {
                Ok(execution) => CaseReport {
                    input: case.input.clone(),
                    expected: case.output.clone(),
                    passed: outputs_match(&execution.output.answer, &case.output),
                    actual: Some(execution.output.answer),
                    time_ms: Some(execution.output.time_ms),
                    error: None,
                },
                Err(e) => CaseReport {
                    input: case.input.clone(),
                    expected: case.output.clone(),
                    actual: None,
                    passed: false,
                    time_ms: None,
                    error: Some(describe(&e)),
                },
            })
            .collect()
    }

    /// Run hidden cases in order, stopping at the first failure.
    pub fn submit(&self, language: &str, code: &str, cases: &[TestCase]) -> Result<SubmissionOutcome> {
        if cases.is_empty() {
            return Err(LauncherError::InvalidRequest(
                "no hidden test cases to judge against".to_string(),
            ));
        }

        let mut total_time = 0u64;
        for (index, case) in cases.iter().enumerate() {
            match self.execute(language, code, &case.input) {
                Ok(execution) => {
                    total_time += execution.output.time_ms;
                    if !outputs_match(&execution.output.answer, &case.output) {
                        return Ok(SubmissionOutcome::failed(Verdict::WrongAnswer, index, None));
                    }
                }
                Err(LauncherError::Timeout { elapsed_ms }) => {
                    return Ok(SubmissionOutcome::failed(
                        Verdict::TimeLimitExceeded,
                        index,
                        Some(format!("killed after {} ms", elapsed_ms)),
                    ));
                }
                Err(e) if is_caller_error(&e) => return Err(e),
                Err(e) => {
                    return Ok(SubmissionOutcome::failed(
                        Verdict::RuntimeError,
                        index,
                        Some(describe(&e)),
                    ));
                }
            }
        }

        Ok(SubmissionOutcome {
            status: Verdict::Accepted,
            time_ms: Some(total_time),
            memory_mb: Some(self.launcher.defaults().limits.memory_mb),
            failed_case: None,
            detail: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answer_and_timing_are_parsed() {
        let parsed = parse_output("[1, 2]\nTIME_MS=17\n");
        assert_eq!(parsed.answer, "[1, 2]");
        assert_eq!(parsed.time_ms, 17);
    }

    #[test]
    fn timing_defaults_to_zero() {
        let parsed = parse_output("\n  42  \n");
        assert_eq!(parsed.answer, "42");
        assert_eq!(parsed.time_ms, 0);
        assert_eq!(parse_output("").answer, "");
        assert_eq!(parse_output("x\nTIME_MS=abc").time_ms, 0);
    }

    #[test]
    fn comparison_ignores_surrounding_whitespace() {
        assert!(outputs_match(" 3\n", "3"));
        assert!(!outputs_match("3", "4"));
    }

    #[test]
    fn suite_uses_camel_case_keys() {
        let suite: TestSuite = serde_json::from_str(
            r#"{"testCases":[{"input":"[1]","output":"1"}],"hiddenTestCases":[]}"#,
        )
        .unwrap();
        assert_eq!(suite.test_cases.len(), 1);
        assert!(suite.hidden_test_cases.is_empty());
    }

    #[test]
    fn verdicts_serialize_as_display_strings() {
        let outcome = SubmissionOutcome::failed(Verdict::WrongAnswer, 2, None);
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["status"], "Wrong Answer");
        assert_eq!(value["failedCase"], 2);
        assert!(value.get("timeMs").is_none());
    }

    #[test]
    fn stderr_is_included_in_runtime_errors() {
        let err = LauncherError::NonZeroExit {
            code: 1,
            stderr: "Traceback: boom\n".to_string(),
        };
        assert!(describe(&err).ends_with("Traceback: boom"));
    }
}
