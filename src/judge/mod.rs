//! Code submission judging.
//!
//! Harnesses adapt a submitted solution to the stdin/stdout contract; the
//! [`runner::Judge`] writes it to a workspace, runs it through the launcher and
//! compares answers.

pub mod adapter;
pub mod languages;
pub mod registry;
pub mod runner;

pub use registry::harness_for;
pub use runner::{
    parse_output, CaseReport, Execution, HarnessOutput, Judge, SubmissionOutcome, TestCase,
    TestSuite, Verdict,
};
