//! Phase steps and the generic retry driver.
//!
//! Each phase is a bounded unit of work declaring its own retry count,
//! timeout, and whether it may suspend at the human-signal gate. The
//! driver retries transient failures with backoff inside the phase;
//! anything that survives the phase's own budget is fatal to the run.

pub mod generate;
pub mod publish;
pub mod resolve;
pub mod setup;
pub mod validate;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::state::{Phase, PipelineRun};
use crate::error::{GateError, LlmError, SandboxError, TrackerError, VcsError};

/// Failure of one phase attempt.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("phase '{phase}' timed out after {seconds}s")]
    Timeout { phase: Phase, seconds: u64 },

    #[error("generation backend error: {0}")]
    Llm(#[from] LlmError),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("VCS error: {0}")]
    Vcs(#[from] VcsError),

    #[error("gate error: {0}")]
    Gate(#[from] GateError),

    #[error("malformed backend response: {0}")]
    MalformedResponse(String),
}

impl PhaseError {
    /// Whether the attempt is worth repeating within the phase budget.
    ///
    /// Security rejections and malformed responses are never retried;
    /// a phase timeout counts as an ordinary transient failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            PhaseError::Timeout { .. } => true,
            PhaseError::Llm(e) => e.is_retryable(),
            PhaseError::Sandbox(e) => e.is_retryable(),
            PhaseError::Tracker(e) => matches!(e, TrackerError::RequestFailed(_)),
            PhaseError::Vcs(e) => matches!(e, VcsError::RequestFailed(_)),
            PhaseError::Gate(_) => false,
            PhaseError::MalformedResponse(_) => false,
        }
    }
}

/// What the orchestrator should do after a phase completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Proceed along the normal phase order.
    Continue,
    /// Jump to a specific phase (e.g., back to generation).
    Goto(Phase),
    /// Terminate the run unsuccessfully.
    Abort(String),
}

/// One pipeline phase.
#[async_trait]
pub trait PhaseStep: Send + Sync {
    /// Which phase this step implements.
    fn phase(&self) -> Phase;

    /// Attempts allowed before the failure becomes fatal.
    fn max_attempts(&self) -> u32 {
        1
    }

    /// Wall-clock budget for one attempt. Ignored for suspending steps.
    fn timeout(&self) -> Duration {
        Duration::from_secs(300)
    }

    /// Whether the step may park at the human-signal gate. Suspension
    /// is indefinite and exempt from the phase timeout.
    fn may_suspend(&self) -> bool {
        false
    }

    /// Runs the phase, mutating the run's accumulated outputs.
    async fn execute(&self, run: &mut PipelineRun) -> Result<StepOutcome, PhaseError>;
}

/// Drives one step to completion, retrying transient failures with
/// exponential backoff up to the step's own budget.
pub async fn run_step(
    step: &dyn PhaseStep,
    run: &mut PipelineRun,
) -> Result<StepOutcome, PhaseError> {
    let mut attempt = 1u32;

    loop {
        tracing::info!(
            run_id = %run.id,
            phase = %step.phase(),
            attempt,
            "executing phase"
        );

        let result = if step.may_suspend() {
            step.execute(run).await
        } else {
            match tokio::time::timeout(step.timeout(), step.execute(run)).await {
                Ok(result) => result,
                Err(_) => Err(PhaseError::Timeout {
                    phase: step.phase(),
                    seconds: step.timeout().as_secs(),
                }),
            }
        };

        match result {
            Ok(outcome) => return Ok(outcome),
            Err(e) if e.is_retryable() && attempt < step.max_attempts() => {
                let delay = backoff_delay(attempt);
                tracing::warn!(
                    run_id = %run.id,
                    phase = %step.phase(),
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "phase attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::error!(
                    run_id = %run.id,
                    phase = %step.phase(),
                    attempt,
                    error = %e,
                    "phase failed"
                );
                return Err(e);
            }
        }
    }
}

/// Exponential backoff, capped at 30 seconds.
fn backoff_delay(attempt: u32) -> Duration {
    let secs = 2u64.saturating_pow(attempt.min(5));
    Duration::from_secs(secs.min(30))
}
