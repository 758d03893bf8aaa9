//! Publish and finalize phases.
//!
//! Publication creates a branch, commits the validated file set, and
//! opens a draft pull request. Every side effect tolerates repetition:
//! branch creation accepts "already exists" and the PR description is
//! derived deterministically from run state, so re-entering after a
//! crash converges on the same result.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{PhaseError, PhaseStep, StepOutcome};
use crate::clients::tracker::TrackerClient;
use crate::clients::vcs::VcsClient;
use crate::pipeline::config::STATUS_REVIEW;
use crate::pipeline::state::{Phase, PipelineRun};

/// Pushes the change and opens a draft pull request.
pub struct PublishPhase {
    vcs: Arc<dyn VcsClient>,
    branch_prefix: String,
}

impl PublishPhase {
    pub fn new(vcs: Arc<dyn VcsClient>, branch_prefix: impl Into<String>) -> Self {
        Self {
            vcs,
            branch_prefix: branch_prefix.into(),
        }
    }

    fn pr_description(run: &PipelineRun) -> String {
        let mut description = format!(
            "Automated implementation of {id}: {title}\n",
            id = run.work_item.id,
            title = run.work_item.title,
        );

        if let Some(ref plan) = run.outputs.technical_plan {
            description.push_str(&format!("\n## Plan\n{plan}\n"));
        }

        if let Some(ref result) = run.outputs.execution_result {
            description.push_str("\n## Validation\n");
            for phase in &result.phases {
                description.push_str(&format!(
                    "- {}: {} ({} ms)\n",
                    phase.phase,
                    if phase.success { "ok" } else { "failed" },
                    phase.duration_ms,
                ));
            }
            if let Some(counts) = result.test_counts {
                description.push_str(&format!(
                    "- tests: {} passed, {} failed\n",
                    counts.passed, counts.failed
                ));
            }
        }

        if !run.outputs.clarifications.is_empty() {
            description.push_str("\n## Clarifications\n");
            for clarification in &run.outputs.clarifications {
                description.push_str(&format!("- {clarification}\n"));
            }
        }

        description
    }
}

#[async_trait]
impl PhaseStep for PublishPhase {
    fn phase(&self) -> Phase {
        Phase::Publish
    }

    fn max_attempts(&self) -> u32 {
        3
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(120)
    }

    async fn execute(&self, run: &mut PipelineRun) -> Result<StepOutcome, PhaseError> {
        let repo = &run.work_item.repository;
        let branch = run.branch_name(&self.branch_prefix);

        self.vcs
            .create_branch(repo, &branch, &run.work_item.base_branch)
            .await?;

        self.vcs
            .commit_files(
                repo,
                &branch,
                &run.outputs.files,
                &format!("{}: {}", run.work_item.id, run.work_item.title),
            )
            .await?;

        let pr = self
            .vcs
            .create_pull_request(
                repo,
                &branch,
                &format!("{}: {}", run.work_item.id, run.work_item.title),
                &Self::pr_description(run),
                &["automated".to_string()],
            )
            .await?;

        tracing::info!(
            run_id = %run.id,
            pr_number = pr.number,
            url = %pr.url,
            "draft pull request created"
        );
        run.outputs.pr = Some(pr);

        Ok(StepOutcome::Continue)
    }
}

/// Hands the work item back to humans for review.
pub struct FinalizePhase {
    tracker: Arc<dyn TrackerClient>,
}

impl FinalizePhase {
    pub fn new(tracker: Arc<dyn TrackerClient>) -> Self {
        Self { tracker }
    }
}

#[async_trait]
impl PhaseStep for FinalizePhase {
    fn phase(&self) -> Phase {
        Phase::Finalize
    }

    fn max_attempts(&self) -> u32 {
        3
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(60)
    }

    async fn execute(&self, run: &mut PipelineRun) -> Result<StepOutcome, PhaseError> {
        self.tracker
            .update_status(&run.work_item.id, STATUS_REVIEW)
            .await?;

        let comment = match run.outputs.pr {
            Some(ref pr) => format!(
                "Implementation ready for review: draft PR #{} ({})",
                pr.number, pr.url
            ),
            None => "Implementation complete; no pull request was created.".to_string(),
        };
        self.tracker
            .post_comment(&run.work_item.id, &comment)
            .await?;

        Ok(StepOutcome::Continue)
    }
}
