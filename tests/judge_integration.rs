//! End-to-end judging through the host backend.
//!
//! Skipped when `python3` is not installed on the machine running the tests.

use runbox::config::loader::{BackendKind, LauncherConfig};
use runbox::judge::{Judge, TestCase, Verdict};
use runbox::safety::workspace::WorkspaceManager;
use runbox::{Launcher, LauncherError};
use std::process::Command;

const ADD: &str = "def solution(a, b):\n    return a + b\n";

fn python_available() -> bool {
    Command::new("python3")
        .arg("--version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

fn launcher() -> Launcher {
    let mut config = LauncherConfig::default();
    config.backend.kind = BackendKind::Host;
    config.backend.allow_degraded = true;
    config.defaults.grace_ms = 200;
    Launcher::from_config(&config).unwrap()
}

fn workspaces(tag: &str) -> WorkspaceManager {
    let base = std::env::temp_dir().join(format!(
        "runbox_judge_{}_{}",
        tag,
        uuid::Uuid::new_v4()
    ));
    WorkspaceManager::new(base).unwrap()
}

fn case(input: &str, output: &str) -> TestCase {
    TestCase {
        input: input.to_string(),
        output: output.to_string(),
    }
}

#[test]
fn test_execute_returns_answer_and_timing() {
    if !python_available() {
        eprintln!("python3 not installed, skipping");
        return;
    }
    let launcher = launcher();
    let manager = workspaces("execute");
    let judge = Judge::new(&launcher, manager.clone());

    let execution = judge.execute("python", ADD, "[2, 3]").unwrap();
    assert_eq!(execution.output.answer, "5");
    assert!(execution.result.success());

    // The workspace is gone once the run is over.
    assert_eq!(std::fs::read_dir(manager.base_dir()).unwrap().count(), 0);
    let _ = std::fs::remove_dir_all(manager.base_dir());
}

#[test]
fn test_run_cases_reports_each_case() {
    if !python_available() {
        eprintln!("python3 not installed, skipping");
        return;
    }
    let launcher = launcher();
    let manager = workspaces("cases");
    let judge = Judge::new(&launcher, manager.clone());

    let reports = judge.run_cases(
        "py",
        ADD,
        &[case("[1, 1]", "2"), case("[2, 2]", "5"), case("[\"a\", 1]", "?")],
    );

    assert_eq!(reports.len(), 3);
    assert!(reports[0].passed);
    assert_eq!(reports[0].actual.as_deref(), Some("2"));
    assert!(!reports[1].passed);
    assert_eq!(reports[1].actual.as_deref(), Some("4"));
    assert!(!reports[2].passed);
    assert!(reports[2].error.as_deref().unwrap().contains("TypeError"));
    let _ = std::fs::remove_dir_all(manager.base_dir());
}

#[test]
fn test_submit_stops_at_first_failure() {
    if !python_available() {
        eprintln!("python3 not installed, skipping");
        return;
    }
    let launcher = launcher();
    let manager = workspaces("submit");
    let judge = Judge::new(&launcher, manager.clone());

    let accepted = judge
        .submit("python", ADD, &[case("[1, 2]", "3"), case("[10, 20]", "30")])
        .unwrap();
    assert_eq!(accepted.status, Verdict::Accepted);
    assert_eq!(accepted.memory_mb, Some(256));

    let wrong = judge
        .submit(
            "python",
            ADD,
            &[case("[1, 2]", "3"), case("[1, 1]", "3"), case("[0, 0]", "0")],
        )
        .unwrap();
    assert_eq!(wrong.status, Verdict::WrongAnswer);
    assert_eq!(wrong.failed_case, Some(1));
    let _ = std::fs::remove_dir_all(manager.base_dir());
}

#[test]
fn test_submit_classifies_timeouts() {
    if !python_available() {
        eprintln!("python3 not installed, skipping");
        return;
    }
    let mut config = LauncherConfig::default();
    config.backend.kind = BackendKind::Host;
    config.backend.allow_degraded = true;
    config.defaults.grace_ms = 200;
    config.defaults.timeout_ms = 500;
    let launcher = Launcher::from_config(&config).unwrap();
    let manager = workspaces("tle");
    let judge = Judge::new(&launcher, manager.clone());

    let spin = "def solution():\n    while True:\n        pass\n";
    let outcome = judge.submit("python", spin, &[case("[]", "0")]).unwrap();
    assert_eq!(outcome.status, Verdict::TimeLimitExceeded);
    assert_eq!(outcome.failed_case, Some(0));
    let _ = std::fs::remove_dir_all(manager.base_dir());
}

#[test]
fn test_unknown_language_is_a_caller_error() {
    let launcher = launcher();
    let manager = workspaces("language");
    let judge = Judge::new(&launcher, manager.clone());

    assert!(matches!(
        judge.submit("cobol", "", &[case("[]", "0")]),
        Err(LauncherError::UnsupportedRuntime(_))
    ));
    assert!(matches!(
        judge.submit("python", ADD, &[]),
        Err(LauncherError::InvalidRequest(_))
    ));
    let _ = std::fs::remove_dir_all(manager.base_dir());
}
