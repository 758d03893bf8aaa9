//! Structured results from a sandbox run.
//!
//! An `ExecutionResult` is immutable once produced: one instance per
//! sandbox run, consumed by the circuit breaker and failure analysis.
//! Validation failures travel through this type as data, never as errors.

use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// The fixed, ordered phases of a sandbox run.
///
/// Ordering matters: `failed_phase` must always be the first phase in
/// this order whose result is unsuccessful, and later phases are skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ValidationPhase {
    Clone,
    ApplyFiles,
    Install,
    Lint,
    Typecheck,
    Test,
}

impl ValidationPhase {
    /// All phases in execution order.
    pub const ORDER: [ValidationPhase; 6] = [
        ValidationPhase::Clone,
        ValidationPhase::ApplyFiles,
        ValidationPhase::Install,
        ValidationPhase::Lint,
        ValidationPhase::Typecheck,
        ValidationPhase::Test,
    ];

    /// Wire name matching the external contract.
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationPhase::Clone => "clone",
            ValidationPhase::ApplyFiles => "applyFiles",
            ValidationPhase::Install => "install",
            ValidationPhase::Lint => "lint",
            ValidationPhase::Typecheck => "typecheck",
            ValidationPhase::Test => "test",
        }
    }
}

impl std::fmt::Display for ValidationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of one phase of a sandbox run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: ValidationPhase,
    pub success: bool,
    pub exit_code: i64,
    /// Combined stdout/stderr, already masked.
    pub output: String,
    pub duration_ms: u64,
}

impl PhaseResult {
    /// Creates a successful phase result.
    pub fn ok(phase: ValidationPhase, output: impl Into<String>, duration: Duration) -> Self {
        Self {
            phase,
            success: true,
            exit_code: 0,
            output: output.into(),
            duration_ms: duration.as_millis() as u64,
        }
    }

    /// Creates a failed phase result.
    pub fn failed(
        phase: ValidationPhase,
        exit_code: i64,
        output: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            phase,
            success: false,
            exit_code,
            output: output.into(),
            duration_ms: duration.as_millis() as u64,
        }
    }
}

/// Structured test counts parsed from test runner output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TestCounts {
    pub passed: u32,
    pub failed: u32,
}

impl TestCounts {
    /// Best-effort extraction of pass/fail counts from common test
    /// runner summaries (jest, pytest, cargo test).
    pub fn parse(output: &str) -> Option<Self> {
        let patterns = [
            // jest: "Tests: 1 failed, 12 passed, 13 total"
            (
                r"Tests:\s+(?:(\d+)\s+failed,\s+)?(\d+)\s+passed",
                true,
            ),
            // cargo test: "test result: ok. 10 passed; 0 failed"
            (r"(\d+)\s+passed;\s+(\d+)\s+failed", false),
            // pytest: "3 failed, 10 passed" or "10 passed"
            (r"(?:(\d+)\s+failed,\s+)?(\d+)\s+passed", true),
        ];

        for (pattern, failed_first) in patterns {
            let re = Regex::new(pattern).expect("static test-count pattern must compile");
            if let Some(caps) = re.captures(output) {
                let (failed, passed) = if failed_first {
                    (
                        caps.get(1)
                            .and_then(|m| m.as_str().parse().ok())
                            .unwrap_or(0),
                        caps.get(2)?.as_str().parse().ok()?,
                    )
                } else {
                    (
                        caps.get(2)?.as_str().parse().ok()?,
                        caps.get(1)?.as_str().parse().ok()?,
                    )
                };
                return Some(Self { passed, failed });
            }
        }

        None
    }
}

/// Immutable result of a complete sandbox run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Per-phase results, in execution order. Skipped phases are absent.
    pub phases: Vec<PhaseResult>,
    /// Overall success (every executed phase succeeded).
    pub success: bool,
    /// First failed phase, if any. Later phases were skipped.
    pub failed_phase: Option<ValidationPhase>,
    /// Parsed test counts when the test phase ran.
    pub test_counts: Option<TestCounts>,
}

impl ExecutionResult {
    /// Assembles a result from ordered phase results, deriving `success`
    /// and `failed_phase` so the first-failure invariant holds by
    /// construction.
    pub fn from_phases(phases: Vec<PhaseResult>) -> Self {
        let failed_phase = phases.iter().find(|p| !p.success).map(|p| p.phase);
        let test_counts = phases
            .iter()
            .find(|p| p.phase == ValidationPhase::Test)
            .and_then(|p| TestCounts::parse(&p.output));

        Self {
            success: failed_phase.is_none(),
            failed_phase,
            phases,
            test_counts,
        }
    }

    /// Result of the given phase, if it ran.
    pub fn phase(&self, phase: ValidationPhase) -> Option<&PhaseResult> {
        self.phases.iter().find(|p| p.phase == phase)
    }

    /// Tail of the failed phase's output, for failure-analysis prompts.
    pub fn failure_tail(&self, max_chars: usize) -> Option<String> {
        let failed = self.failed_phase?;
        let output = &self.phase(failed)?.output;
        let start = output
            .char_indices()
            .rev()
            .nth(max_chars.saturating_sub(1))
            .map(|(i, _)| i)
            .unwrap_or(0);
        Some(output[start..].to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(phase: ValidationPhase) -> PhaseResult {
        PhaseResult::ok(phase, "done", Duration::from_millis(100))
    }

    fn failed(phase: ValidationPhase) -> PhaseResult {
        PhaseResult::failed(phase, 1, "boom", Duration::from_millis(100))
    }

    #[test]
    fn test_phase_order() {
        let order = ValidationPhase::ORDER;
        assert_eq!(order[0], ValidationPhase::Clone);
        assert_eq!(order[5], ValidationPhase::Test);
        assert!(ValidationPhase::Install < ValidationPhase::Lint);
    }

    #[test]
    fn test_phase_wire_names() {
        assert_eq!(ValidationPhase::ApplyFiles.as_str(), "applyFiles");
        assert_eq!(ValidationPhase::Typecheck.to_string(), "typecheck");
    }

    #[test]
    fn test_all_phases_succeed() {
        let result = ExecutionResult::from_phases(vec![
            ok(ValidationPhase::Clone),
            ok(ValidationPhase::ApplyFiles),
            ok(ValidationPhase::Install),
            ok(ValidationPhase::Test),
        ]);
        assert!(result.success);
        assert!(result.failed_phase.is_none());
    }

    #[test]
    fn test_failed_phase_is_first_failure() {
        let result = ExecutionResult::from_phases(vec![
            ok(ValidationPhase::Clone),
            ok(ValidationPhase::ApplyFiles),
            failed(ValidationPhase::Install),
        ]);
        assert!(!result.success);
        assert_eq!(result.failed_phase, Some(ValidationPhase::Install));
        // Later phases never ran.
        assert!(result.phase(ValidationPhase::Lint).is_none());
        assert!(result.phase(ValidationPhase::Test).is_none());
    }

    #[test]
    fn test_failure_tail() {
        let mut phase = failed(ValidationPhase::Test);
        phase.output = format!("{}END", "x".repeat(100));
        let result = ExecutionResult::from_phases(vec![ok(ValidationPhase::Clone), phase]);

        let tail = result.failure_tail(3).unwrap();
        assert_eq!(tail, "END");
    }

    #[test]
    fn test_test_counts_jest() {
        let counts = TestCounts::parse("Tests: 2 failed, 11 passed, 13 total").unwrap();
        assert_eq!(counts.failed, 2);
        assert_eq!(counts.passed, 11);
    }

    #[test]
    fn test_test_counts_pytest_all_passed() {
        let counts = TestCounts::parse("===== 14 passed in 2.31s =====").unwrap();
        assert_eq!(counts.passed, 14);
        assert_eq!(counts.failed, 0);
    }

    #[test]
    fn test_test_counts_cargo() {
        let counts = TestCounts::parse("test result: ok. 42 passed; 0 failed; 1 ignored").unwrap();
        assert_eq!(counts.passed, 42);
        assert_eq!(counts.failed, 0);
    }

    #[test]
    fn test_test_counts_absent() {
        assert!(TestCounts::parse("no summary line here").is_none());
    }

    #[test]
    fn test_counts_extracted_from_test_phase() {
        let mut phase = ok(ValidationPhase::Test);
        phase.output = "Tests: 1 failed, 9 passed, 10 total".to_string();
        let result = ExecutionResult::from_phases(vec![phase]);
        assert_eq!(
            result.test_counts,
            Some(TestCounts {
                passed: 9,
                failed: 1
            })
        );
    }
}
