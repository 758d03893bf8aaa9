//! Pipeline orchestrator.
//!
//! Drives the fixed phase sequence for one run, checkpoints after
//! every transition, and owns all routing decisions: retry after a
//! validation failure, escalation to a human, or terminal abort. The
//! work item always ends in a terminal tracker status; it is never
//! left silently stuck.

use std::sync::Arc;

use anyhow::Result;

use super::checkpoint::CheckpointStore;
use super::config::{PipelineConfig, STATUS_FAILED};
use super::phases::generate::GeneratePhase;
use super::phases::publish::{FinalizePhase, PublishPhase};
use super::phases::resolve::{AmbiguityPhase, ApprovalPhase, SolutionPhase};
use super::phases::setup::{ContextPhase, SetupPhase};
use super::phases::validate::ValidatePhase;
use super::phases::{run_step, StepOutcome};
use super::state::{Phase, PipelineOutcome, PipelineRun, RunStatus};
use crate::breaker::{CircuitBreaker, RetryDecision};
use crate::clients::tracker::TrackerClient;
use crate::clients::vcs::VcsClient;
use crate::gate::SignalGate;
use crate::llm::client::GenerationBackend;
use crate::sandbox::limits::ResourceLimits;
use crate::sandbox::service::ExecutionService;
use crate::secrets::CredentialSet;
use uuid::Uuid;

/// Sequences phases and persists run state across them.
pub struct Orchestrator {
    config: PipelineConfig,
    tracker: Arc<dyn TrackerClient>,
    vcs: Arc<dyn VcsClient>,
    backend: Arc<dyn GenerationBackend>,
    breaker: Arc<CircuitBreaker>,
    sandbox: Arc<dyn ExecutionService>,
    gate: Arc<SignalGate>,
    checkpoints: Arc<CheckpointStore>,
    limits: ResourceLimits,
    credentials: CredentialSet,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: PipelineConfig,
        tracker: Arc<dyn TrackerClient>,
        vcs: Arc<dyn VcsClient>,
        backend: Arc<dyn GenerationBackend>,
        breaker: Arc<CircuitBreaker>,
        sandbox: Arc<dyn ExecutionService>,
        gate: Arc<SignalGate>,
    ) -> Self {
        let checkpoints = Arc::new(CheckpointStore::new(config.state_dir.clone()));
        Self {
            config,
            tracker,
            vcs,
            backend,
            breaker,
            sandbox,
            gate,
            checkpoints,
            limits: ResourceLimits::default(),
            credentials: CredentialSet::default(),
        }
    }

    /// Sets the resource caps applied to every sandbox run.
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Sets the credentials injected into sandboxes.
    pub fn with_credentials(mut self, credentials: CredentialSet) -> Self {
        self.credentials = credentials;
        self
    }

    /// The shared breaker, for operator inspection and reset.
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Runs the full pipeline for a work item.
    pub async fn run(&self, work_item_id: &str) -> Result<PipelineOutcome> {
        let work_item = self.tracker.get_work_item(work_item_id).await?;
        let run = PipelineRun::new(work_item);
        tracing::info!(run_id = %run.id, work_item = work_item_id, "pipeline run starting");
        self.drive(run).await
    }

    /// Resumes a run from its last checkpoint.
    pub async fn resume(&self, run_id: Uuid) -> Result<PipelineOutcome> {
        let run = self.checkpoints.load(run_id)?;
        if run.status != RunStatus::InProgress {
            tracing::info!(run_id = %run.id, status = ?run.status, "run already terminal");
            return Ok(outcome_of(&run, None));
        }
        tracing::info!(
            run_id = %run.id,
            phase = %run.current_phase,
            "resuming from checkpoint"
        );
        self.drive(run).await
    }

    /// Lists run ids with a stored checkpoint.
    pub fn stored_runs(&self) -> Result<Vec<Uuid>> {
        Ok(self.checkpoints.list()?)
    }

    async fn drive(&self, mut run: PipelineRun) -> Result<PipelineOutcome> {
        loop {
            self.checkpoints.save(&run)?;

            let step_result = match run.current_phase {
                Phase::Setup => {
                    run_step(&SetupPhase::new(self.tracker.clone()), &mut run).await
                }
                Phase::ContextRetrieval => {
                    run_step(&ContextPhase::new(self.backend.clone()), &mut run).await
                }
                Phase::Generate => {
                    run_step(&GeneratePhase::new(self.backend.clone()), &mut run).await
                }
                Phase::Validate => {
                    let step = ValidatePhase::new(
                        self.sandbox.clone(),
                        self.backend.clone(),
                        self.limits.clone(),
                        self.credentials.clone(),
                    );
                    run_step(&step, &mut run).await
                }
                Phase::AmbiguityResolution => {
                    let step = AmbiguityPhase::new(
                        self.gate.clone(),
                        self.tracker.clone(),
                        self.checkpoints.clone(),
                    );
                    run_step(&step, &mut run).await
                }
                Phase::SolutionResolution => {
                    let step = SolutionPhase::new(
                        self.gate.clone(),
                        self.tracker.clone(),
                        self.checkpoints.clone(),
                    );
                    run_step(&step, &mut run).await
                }
                Phase::PreApproval => {
                    let step = ApprovalPhase::new(
                        self.gate.clone(),
                        self.tracker.clone(),
                        self.checkpoints.clone(),
                    );
                    run_step(&step, &mut run).await
                }
                Phase::Publish => {
                    let step = PublishPhase::new(self.vcs.clone(), &self.config.branch_prefix);
                    run_step(&step, &mut run).await
                }
                Phase::Finalize => {
                    run_step(&FinalizePhase::new(self.tracker.clone()), &mut run).await
                }
            };

            let next = match step_result {
                Err(e) => return self.fail(run, e.to_string()).await,
                Ok(StepOutcome::Abort(reason)) => return self.fail(run, reason).await,
                Ok(StepOutcome::Goto(phase)) => Some(phase),
                Ok(StepOutcome::Continue) => match run.current_phase {
                    Phase::Validate => match self.route_after_validation(&mut run) {
                        Routing::Next(phase) => Some(phase),
                        Routing::Fail(reason) => return self.fail(run, reason).await,
                    },
                    other => self.next_in_order(other, &run),
                },
            };

            match next {
                Some(phase) => {
                    tracing::debug!(
                        run_id = %run.id,
                        from = %run.current_phase,
                        to = %phase,
                        "phase transition"
                    );
                    run.current_phase = phase;
                }
                None => return self.succeed(run).await,
            }
        }
    }

    /// Normal successor for phases without special routing. `None`
    /// ends the run successfully.
    fn next_in_order(&self, phase: Phase, run: &PipelineRun) -> Option<Phase> {
        match phase {
            Phase::Setup => Some(Phase::ContextRetrieval),
            Phase::ContextRetrieval => Some(Phase::Generate),
            Phase::Generate => Some(Phase::Validate),
            Phase::Validate => Some(self.after_successful_validation(run)),
            Phase::AmbiguityResolution | Phase::SolutionResolution => {
                Some(self.before_publish())
            }
            Phase::PreApproval => Some(Phase::Publish),
            Phase::Publish => Some(Phase::Finalize),
            Phase::Finalize => None,
        }
    }

    fn after_successful_validation(&self, run: &PipelineRun) -> Phase {
        if !run.outputs.ambiguities.is_empty() {
            Phase::AmbiguityResolution
        } else {
            self.before_publish()
        }
    }

    fn before_publish(&self) -> Phase {
        if self.config.require_approval {
            Phase::PreApproval
        } else {
            Phase::Publish
        }
    }

    /// Routing after the validation phase reported its result.
    fn route_after_validation(&self, run: &mut PipelineRun) -> Routing {
        let success = run
            .outputs
            .execution_result
            .as_ref()
            .map(|r| r.success)
            .unwrap_or(false);

        if success {
            return Routing::Next(self.after_successful_validation(run));
        }

        run.validation_attempts += 1;
        let decision = self
            .breaker
            .decide(run.validation_attempts, self.config.retry_budget);

        tracing::info!(
            run_id = %run.id,
            attempt = run.validation_attempts,
            budget = self.config.retry_budget,
            decision = %decision,
            "validation failed"
        );

        match decision {
            RetryDecision::Retry => Routing::Next(Phase::Generate),
            RetryDecision::Escalate => {
                let has_fixes = run
                    .outputs
                    .failure_analysis
                    .as_ref()
                    .is_some_and(|a| a.has_multiple_fixes());
                if has_fixes {
                    Routing::Next(Phase::SolutionResolution)
                } else {
                    Routing::Fail(format!(
                        "validation retry budget of {} attempts exhausted",
                        self.config.retry_budget
                    ))
                }
            }
            RetryDecision::Abort => Routing::Fail(
                "generation backend circuit breaker is open; reset it before retrying"
                    .to_string(),
            ),
        }
    }

    async fn succeed(&self, mut run: PipelineRun) -> Result<PipelineOutcome> {
        run.status = RunStatus::Succeeded;
        self.checkpoints.save(&run)?;
        self.gate.release_run(run.id);
        tracing::info!(run_id = %run.id, "pipeline run succeeded");
        Ok(outcome_of(&run, None))
    }

    async fn fail(&self, mut run: PipelineRun, reason: String) -> Result<PipelineOutcome> {
        run.status = RunStatus::Failed;
        self.checkpoints.save(&run)?;
        self.gate.release_run(run.id);

        tracing::error!(
            run_id = %run.id,
            phase = %run.current_phase,
            reason = %reason,
            "pipeline run failed"
        );

        // Terminal reporting is best-effort; the failure outcome stands
        // even if the tracker is down.
        if let Err(e) = self
            .tracker
            .update_status(&run.work_item.id, STATUS_FAILED)
            .await
        {
            tracing::warn!(run_id = %run.id, error = %e, "could not set failed status");
        }
        if let Err(e) = self
            .tracker
            .post_comment(
                &run.work_item.id,
                &format!(
                    "Automated implementation failed in the '{}' phase: {reason}",
                    run.current_phase
                ),
            )
            .await
        {
            tracing::warn!(run_id = %run.id, error = %e, "could not post failure comment");
        }

        Ok(outcome_of(&run, Some(reason)))
    }
}

enum Routing {
    Next(Phase),
    Fail(String),
}

fn outcome_of(run: &PipelineRun, error: Option<String>) -> PipelineOutcome {
    let error = error.or_else(|| match run.status {
        RunStatus::Failed | RunStatus::Aborted => {
            Some("run previously ended in failure".to_string())
        }
        _ => None,
    });

    PipelineOutcome {
        success: run.status == RunStatus::Succeeded,
        final_phase: run.current_phase,
        pr: run.outputs.pr.clone(),
        files_generated: run.outputs.files.len(),
        attempts: run.validation_attempts,
        error,
    }
}
