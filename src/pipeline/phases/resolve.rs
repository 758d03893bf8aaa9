//! Human-resolution phases: ambiguity, solution choice, pre-approval.
//!
//! These are the only phases allowed to suspend. Each marks the work
//! item blocked while its question is outstanding and unblocks it once
//! a decision arrives, so the item is never silently stuck.

use std::sync::Arc;

use async_trait::async_trait;

use super::{PhaseError, PhaseStep, StepOutcome};
use crate::clients::tracker::TrackerClient;
use crate::gate::question::{Decision, Question, QuestionOption, QuestionType};
use crate::gate::SignalGate;
use crate::pipeline::checkpoint::CheckpointStore;
use crate::pipeline::config::{STATUS_BLOCKED, STATUS_IN_PROGRESS};
use crate::pipeline::state::{Phase, PipelineRun};

const PROCEED_OPTION: &str = "proceed";
const REGENERATE_OPTION: &str = "regenerate";
const ABORT_OPTION: &str = "abort";
const APPROVE_OPTION: &str = "approve";
const REJECT_OPTION: &str = "reject";

/// Posts the question (or reattaches to one a crashed process already
/// posted), records it in the run's checkpoint for the duration of the
/// suspension, and clears it once the decision arrives.
async fn ask_blocking(
    gate: &SignalGate,
    tracker: &dyn TrackerClient,
    checkpoints: &CheckpointStore,
    run: &mut PipelineRun,
    question: Question,
) -> Result<Decision, PhaseError> {
    tracker
        .update_status(&run.work_item.id, STATUS_BLOCKED)
        .await?;

    let run_id = run.id;
    let work_item_id = run.work_item.id.clone();

    let decision = match run.outputs.pending_question.clone() {
        Some(pending) => gate.resume_pending(run_id, pending).await?,
        None => {
            gate.ask_with(run_id, &work_item_id, question, |pending| {
                run.outputs.pending_question = Some(pending.clone());
                // A failed save costs resume fidelity, never the wait
                // itself.
                if let Err(e) = checkpoints.save(run) {
                    tracing::warn!(
                        run_id = %run_id,
                        error = %e,
                        "could not checkpoint the pending question"
                    );
                }
            })
            .await?
        }
    };

    run.outputs.pending_question = None;

    tracker
        .update_status(&run.work_item.id, STATUS_IN_PROGRESS)
        .await?;

    Ok(decision)
}

/// Resolves ambiguities the generation phase flagged.
pub struct AmbiguityPhase {
    gate: Arc<SignalGate>,
    tracker: Arc<dyn TrackerClient>,
    checkpoints: Arc<CheckpointStore>,
}

impl AmbiguityPhase {
    pub fn new(
        gate: Arc<SignalGate>,
        tracker: Arc<dyn TrackerClient>,
        checkpoints: Arc<CheckpointStore>,
    ) -> Self {
        Self {
            gate,
            tracker,
            checkpoints,
        }
    }
}

#[async_trait]
impl PhaseStep for AmbiguityPhase {
    fn phase(&self) -> Phase {
        Phase::AmbiguityResolution
    }

    fn may_suspend(&self) -> bool {
        true
    }

    async fn execute(&self, run: &mut PipelineRun) -> Result<StepOutcome, PhaseError> {
        let ambiguities = std::mem::take(&mut run.outputs.ambiguities);
        // A checkpointed pending question means a prior process was
        // already suspended here; ask again even with nothing to list.
        if ambiguities.is_empty() && run.outputs.pending_question.is_none() {
            return Ok(StepOutcome::Continue);
        }

        let mut prompt = String::from(
            "The generated implementation rests on assumptions that may not match intent:\n",
        );
        for ambiguity in &ambiguities {
            prompt.push_str(&format!("- {ambiguity}\n"));
        }
        prompt.push_str("\nHow should the run proceed?");

        let question = Question::new(QuestionType::Clarification, prompt)
            .with_option(
                QuestionOption::new(PROCEED_OPTION, "Proceed with the current assumptions")
                    .recommended(),
            )
            .with_option(QuestionOption::new(
                REGENERATE_OPTION,
                "Regenerate, treating the flagged points as requirements to clarify in comments",
            ))
            .with_option(QuestionOption::new(ABORT_OPTION, "Abort the run"));

        let decision = ask_blocking(
            &self.gate,
            self.tracker.as_ref(),
            &self.checkpoints,
            run,
            question,
        )
        .await?;

        match decision.option_id.as_deref() {
            Some(PROCEED_OPTION) => {
                run.outputs.clarifications.extend(
                    ambiguities
                        .iter()
                        .map(|a| format!("Assumption accepted: {a}")),
                );
                Ok(StepOutcome::Continue)
            }
            Some(REGENERATE_OPTION) => {
                run.outputs
                    .clarifications
                    .extend(ambiguities.iter().map(|a| format!("Clarify: {a}")));
                Ok(StepOutcome::Goto(Phase::Generate))
            }
            _ => Ok(StepOutcome::Abort(
                "run aborted at ambiguity resolution".to_string(),
            )),
        }
    }
}

/// Lets a human pick among viable fixes after repeated validation
/// failures.
pub struct SolutionPhase {
    gate: Arc<SignalGate>,
    tracker: Arc<dyn TrackerClient>,
    checkpoints: Arc<CheckpointStore>,
}

impl SolutionPhase {
    pub fn new(
        gate: Arc<SignalGate>,
        tracker: Arc<dyn TrackerClient>,
        checkpoints: Arc<CheckpointStore>,
    ) -> Self {
        Self {
            gate,
            tracker,
            checkpoints,
        }
    }
}

#[async_trait]
impl PhaseStep for SolutionPhase {
    fn phase(&self) -> Phase {
        Phase::SolutionResolution
    }

    fn may_suspend(&self) -> bool {
        true
    }

    async fn execute(&self, run: &mut PipelineRun) -> Result<StepOutcome, PhaseError> {
        let analysis = match run.outputs.failure_analysis {
            Some(ref a) if !a.candidate_fixes.is_empty() => a.clone(),
            _ => {
                return Ok(StepOutcome::Abort(
                    "validation kept failing and no viable fixes were identified".to_string(),
                ))
            }
        };

        let mut question = Question::new(
            QuestionType::SolutionChoice,
            format!(
                "Validation keeps failing after {} attempts.\n\nDiagnosis: {}\n\nPick a fix:",
                run.validation_attempts, analysis.summary
            ),
        );
        for fix in &analysis.candidate_fixes {
            question = question.with_option(fix.clone());
        }

        let decision = ask_blocking(
            &self.gate,
            self.tracker.as_ref(),
            &self.checkpoints,
            run,
            question,
        )
        .await?;

        let chosen = decision.option_id.as_deref().and_then(|id| {
            analysis
                .candidate_fixes
                .iter()
                .find(|fix| fix.id == id)
        });

        match chosen {
            Some(fix) => {
                tracing::info!(run_id = %run.id, fix = %fix.id, "fix selected, regenerating");
                run.outputs.chosen_fix = Some(if fix.description.is_empty() {
                    fix.label.clone()
                } else {
                    format!("{}: {}", fix.label, fix.description)
                });
                // Fresh retry budget for the chosen approach.
                run.validation_attempts = 0;
                Ok(StepOutcome::Goto(Phase::Generate))
            }
            None => Ok(StepOutcome::Abort(
                "no fix was selected for the failing validation".to_string(),
            )),
        }
    }
}

/// Requires sign-off before the change is published.
pub struct ApprovalPhase {
    gate: Arc<SignalGate>,
    tracker: Arc<dyn TrackerClient>,
    checkpoints: Arc<CheckpointStore>,
}

impl ApprovalPhase {
    pub fn new(
        gate: Arc<SignalGate>,
        tracker: Arc<dyn TrackerClient>,
        checkpoints: Arc<CheckpointStore>,
    ) -> Self {
        Self {
            gate,
            tracker,
            checkpoints,
        }
    }
}

#[async_trait]
impl PhaseStep for ApprovalPhase {
    fn phase(&self) -> Phase {
        Phase::PreApproval
    }

    fn may_suspend(&self) -> bool {
        true
    }

    async fn execute(&self, run: &mut PipelineRun) -> Result<StepOutcome, PhaseError> {
        let tests = run
            .outputs
            .execution_result
            .as_ref()
            .and_then(|r| r.test_counts)
            .map(|c| format!("{} passed, {} failed", c.passed, c.failed))
            .unwrap_or_else(|| "not reported".to_string());

        let question = Question::new(
            QuestionType::Approval,
            format!(
                "Validation passed ({} files, tests: {tests}).\n\nPlan:\n{}\n\nPublish as a draft \
                 pull request?",
                run.outputs.files.len(),
                run.outputs.technical_plan.as_deref().unwrap_or("(none)"),
            ),
        )
        .with_option(QuestionOption::new(APPROVE_OPTION, "Publish the draft PR").recommended())
        .with_option(QuestionOption::new(REJECT_OPTION, "Reject and abort"));

        let decision = ask_blocking(
            &self.gate,
            self.tracker.as_ref(),
            &self.checkpoints,
            run,
            question,
        )
        .await?;

        match decision.option_id.as_deref() {
            Some(APPROVE_OPTION) => Ok(StepOutcome::Continue),
            _ => Ok(StepOutcome::Abort("publication was not approved".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::clients::tracker::WorkItem;
    use crate::error::TrackerError;
    use crate::gate::question::{QuestionOption, TimeoutPolicy};
    use crate::pipeline::state::FailureAnalysis;
    use uuid::Uuid;

    struct LogTracker {
        statuses: Mutex<Vec<String>>,
        questions: Mutex<Vec<Question>>,
    }

    impl LogTracker {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                statuses: Mutex::new(Vec::new()),
                questions: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl TrackerClient for LogTracker {
        async fn get_work_item(&self, id: &str) -> Result<WorkItem, TrackerError> {
            Err(TrackerError::WorkItemNotFound(id.to_string()))
        }

        async fn update_status(&self, _id: &str, status: &str) -> Result<(), TrackerError> {
            self.statuses.lock().unwrap().push(status.to_string());
            Ok(())
        }

        async fn post_comment(&self, _id: &str, _text: &str) -> Result<(), TrackerError> {
            Ok(())
        }

        async fn post_question(
            &self,
            _id: &str,
            question: &Question,
        ) -> Result<Uuid, TrackerError> {
            self.questions.lock().unwrap().push(question.clone());
            Ok(question.id)
        }
    }

    fn sample_run() -> PipelineRun {
        PipelineRun::new(WorkItem {
            id: "PROJ-1".to_string(),
            project_id: "PROJ".to_string(),
            title: "Add rate limiting".to_string(),
            description: "Limit requests per client.".to_string(),
            repository: "acme/api".to_string(),
            base_branch: "main".to_string(),
            status: "To Do".to_string(),
        })
    }

    fn quick_gate(tracker: Arc<LogTracker>, policy: TimeoutPolicy) -> Arc<SignalGate> {
        Arc::new(SignalGate::new(tracker, Duration::from_millis(30), policy))
    }

    /// Checkpoint store over a shared scratch directory; runs are keyed
    /// by unique ids, so tests do not collide.
    fn store() -> Arc<CheckpointStore> {
        static DIR: std::sync::OnceLock<tempfile::TempDir> = std::sync::OnceLock::new();
        let dir = DIR.get_or_init(|| tempfile::tempdir().unwrap());
        Arc::new(CheckpointStore::new(dir.path()))
    }

    #[tokio::test]
    async fn test_ambiguity_timeout_proceeds_with_assumptions() {
        let tracker = LogTracker::new();
        let gate = quick_gate(tracker.clone(), TimeoutPolicy::PreferRecommended);
        let step = AmbiguityPhase::new(gate, tracker.clone(), store());

        let mut run = sample_run();
        run.outputs.ambiguities = vec!["per-IP or per-token?".to_string()];

        let outcome = step.execute(&mut run).await.unwrap();
        assert_eq!(outcome, StepOutcome::Continue);
        assert!(run.outputs.ambiguities.is_empty());
        assert_eq!(run.outputs.clarifications.len(), 1);

        // Blocked while pending, unblocked after resolution.
        assert_eq!(
            tracker.statuses.lock().unwrap().as_slice(),
            [STATUS_BLOCKED.to_string(), STATUS_IN_PROGRESS.to_string()]
        );
    }

    #[tokio::test]
    async fn test_ambiguity_without_findings_is_passthrough() {
        let tracker = LogTracker::new();
        let gate = quick_gate(tracker.clone(), TimeoutPolicy::PreferRecommended);
        let step = AmbiguityPhase::new(gate, tracker.clone(), store());

        let mut run = sample_run();
        let outcome = step.execute(&mut run).await.unwrap();
        assert_eq!(outcome, StepOutcome::Continue);
        // No question was ever posted.
        assert!(tracker.statuses.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_solution_choice_feeds_fix_and_resets_budget() {
        let tracker = LogTracker::new();
        let gate = quick_gate(tracker.clone(), TimeoutPolicy::PreferRecommended);
        let step = SolutionPhase::new(gate, tracker, store());

        let mut run = sample_run();
        run.validation_attempts = 3;
        run.outputs.failure_analysis = Some(FailureAnalysis {
            summary: "The mock never returns 429.".to_string(),
            candidate_fixes: vec![
                QuestionOption::new("fix-mock", "Fix the mock")
                    .with_description("Return 429 after the limit.")
                    .recommended(),
                QuestionOption::new("fix-route", "Register the route"),
            ],
        });

        let outcome = step.execute(&mut run).await.unwrap();
        assert_eq!(outcome, StepOutcome::Goto(Phase::Generate));
        assert_eq!(run.validation_attempts, 0);
        assert!(run
            .outputs
            .chosen_fix
            .as_deref()
            .unwrap()
            .contains("Fix the mock"));
    }

    #[tokio::test]
    async fn test_solution_without_fixes_aborts() {
        let tracker = LogTracker::new();
        let gate = quick_gate(tracker.clone(), TimeoutPolicy::PreferRecommended);
        let step = SolutionPhase::new(gate, tracker, store());

        let mut run = sample_run();
        run.outputs.failure_analysis = Some(FailureAnalysis::default());

        let outcome = step.execute(&mut run).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Abort(_)));
    }

    #[tokio::test]
    async fn test_approval_timeout_with_abort_policy_blocks_publication() {
        let tracker = LogTracker::new();
        let gate = quick_gate(tracker.clone(), TimeoutPolicy::AlwaysAbort);
        let step = ApprovalPhase::new(gate, tracker, store());

        let mut run = sample_run();
        let outcome = step.execute(&mut run).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Abort(_)));
    }

    #[tokio::test]
    async fn test_approval_human_approve_continues() {
        let tracker = LogTracker::new();
        let gate = Arc::new(SignalGate::new(
            tracker.clone(),
            Duration::from_secs(60),
            TimeoutPolicy::AlwaysAbort,
        ));
        let step = Arc::new(ApprovalPhase::new(gate.clone(), tracker.clone(), store()));

        let step_clone = step.clone();
        let handle = tokio::spawn(async move {
            let mut run = sample_run();
            step_clone.execute(&mut run).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let question_id = tracker.questions.lock().unwrap()[0].id;
        assert!(gate.deliver(question_id, APPROVE_OPTION));

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome, StepOutcome::Continue);
    }

    #[tokio::test]
    async fn test_approval_human_reject_aborts() {
        let tracker = LogTracker::new();
        let gate = Arc::new(SignalGate::new(
            tracker.clone(),
            Duration::from_secs(60),
            TimeoutPolicy::PreferRecommended,
        ));
        let step = Arc::new(ApprovalPhase::new(gate.clone(), tracker.clone(), store()));

        let step_clone = step.clone();
        let handle = tokio::spawn(async move {
            let mut run = sample_run();
            step_clone.execute(&mut run).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let question_id = tracker.questions.lock().unwrap()[0].id;
        assert!(gate.deliver(question_id, REJECT_OPTION));

        let outcome = handle.await.unwrap().unwrap();
        assert!(matches!(outcome, StepOutcome::Abort(_)));
    }

    #[tokio::test]
    async fn test_checkpoint_records_question_while_suspended() {
        let tracker = LogTracker::new();
        let gate = Arc::new(SignalGate::new(
            tracker.clone(),
            Duration::from_secs(60),
            TimeoutPolicy::PreferRecommended,
        ));
        let checkpoints = store();
        let step = Arc::new(AmbiguityPhase::new(
            gate.clone(),
            tracker.clone(),
            checkpoints.clone(),
        ));

        let mut run = sample_run();
        run.outputs.ambiguities = vec!["per-IP or per-token?".to_string()];
        let run_id = run.id;

        let step_clone = step.clone();
        let handle = tokio::spawn(async move {
            let outcome = step_clone.execute(&mut run).await;
            (outcome, run)
        });

        tokio::time::sleep(Duration::from_millis(20)).await;

        // The on-disk run must carry the outstanding question.
        let suspended = checkpoints.load(run_id).unwrap();
        let pending = suspended
            .outputs
            .pending_question
            .expect("question persisted during suspension");
        assert_eq!(pending.question.question_type, QuestionType::Clarification);

        let question_id = tracker.questions.lock().unwrap()[0].id;
        assert!(gate.deliver(question_id, PROCEED_OPTION));

        let (outcome, run) = handle.await.unwrap();
        assert_eq!(outcome.unwrap(), StepOutcome::Continue);
        assert!(run.outputs.pending_question.is_none());
    }

    #[tokio::test]
    async fn test_resumed_run_does_not_repost_its_question() {
        let tracker = LogTracker::new();
        let gate = Arc::new(SignalGate::new(
            tracker.clone(),
            Duration::from_secs(3600),
            TimeoutPolicy::PreferRecommended,
        ));
        let step = ApprovalPhase::new(gate, tracker.clone(), store());

        let question = Question::new(QuestionType::Approval, "Publish as a draft pull request?")
            .with_option(QuestionOption::new(APPROVE_OPTION, "Publish the draft PR").recommended())
            .with_option(QuestionOption::new(REJECT_OPTION, "Reject and abort"));
        let mut run = sample_run();
        run.outputs.pending_question = Some(crate::gate::question::PendingQuestion {
            posted_id: question.id,
            question,
            posted_at: chrono::Utc::now() - chrono::Duration::hours(25),
            deadline: chrono::Utc::now() - chrono::Duration::hours(1),
        });

        let outcome = step.execute(&mut run).await.unwrap();

        // The stored deadline already passed: the recommended default
        // applies and no duplicate question reaches the tracker.
        assert_eq!(outcome, StepOutcome::Continue);
        assert!(run.outputs.pending_question.is_none());
        assert!(tracker.questions.lock().unwrap().is_empty());
    }
}
