//! Run state carried across phases and checkpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clients::tracker::WorkItem;
use crate::clients::vcs::PullRequestRef;
use crate::gate::question::{PendingQuestion, QuestionOption};
use crate::sandbox::files::GeneratedFile;
use crate::sandbox::result::ExecutionResult;

/// One bounded unit of the fixed pipeline.
///
/// Phases execute strictly in this order; the resolution phases are
/// conditional and may be skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Setup,
    ContextRetrieval,
    Generate,
    Validate,
    AmbiguityResolution,
    SolutionResolution,
    PreApproval,
    Publish,
    Finalize,
}

impl Phase {
    /// All phases in pipeline order.
    pub const ORDER: [Phase; 9] = [
        Phase::Setup,
        Phase::ContextRetrieval,
        Phase::Generate,
        Phase::Validate,
        Phase::AmbiguityResolution,
        Phase::SolutionResolution,
        Phase::PreApproval,
        Phase::Publish,
        Phase::Finalize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Setup => "setup",
            Phase::ContextRetrieval => "context_retrieval",
            Phase::Generate => "generate",
            Phase::Validate => "validate",
            Phase::AmbiguityResolution => "ambiguity_resolution",
            Phase::SolutionResolution => "solution_resolution",
            Phase::PreApproval => "pre_approval",
            Phase::Publish => "publish",
            Phase::Finalize => "finalize",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where a run currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    InProgress,
    Succeeded,
    Failed,
    Aborted,
}

/// Enriched analysis of a validation failure, produced by the backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailureAnalysis {
    /// Short diagnosis of what went wrong.
    #[serde(default)]
    pub summary: String,
    /// Viable fixes, as selectable options when escalation is needed.
    #[serde(default)]
    pub candidate_fixes: Vec<QuestionOption>,
}

impl FailureAnalysis {
    /// Whether more than one fix looks viable, which routes the run to
    /// solution resolution instead of a blind retry.
    pub fn has_multiple_fixes(&self) -> bool {
        self.candidate_fixes.len() > 1
    }
}

/// Accumulated outputs of completed phases.
///
/// State produced by phase N is visible and immutable to phase N+1.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseOutputs {
    /// Technical plan from the generation phase.
    pub technical_plan: Option<String>,
    /// Repository context gathered before generation.
    pub context_summary: Option<String>,
    /// Current generated file set.
    pub files: Vec<GeneratedFile>,
    /// Ambiguities the backend flagged in the work item.
    pub ambiguities: Vec<String>,
    /// Human clarifications collected so far.
    pub clarifications: Vec<String>,
    /// Latest sandbox result.
    pub execution_result: Option<ExecutionResult>,
    /// Analysis of the latest validation failure.
    pub failure_analysis: Option<FailureAnalysis>,
    /// Question currently awaiting a human, if any.
    pub pending_question: Option<PendingQuestion>,
    /// Chosen fix from solution resolution, fed into the next retry.
    pub chosen_fix: Option<String>,
    /// Draft pull request, once published.
    pub pr: Option<PullRequestRef>,
}

/// One execution of the full phase sequence for one work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub work_item: WorkItem,
    pub current_phase: Phase,
    pub status: RunStatus,
    pub outputs: PhaseOutputs,
    /// Validation-failure round-trips consumed so far.
    pub validation_attempts: u32,
    pub started_at: DateTime<Utc>,
}

impl PipelineRun {
    pub fn new(work_item: WorkItem) -> Self {
        Self {
            id: Uuid::new_v4(),
            work_item,
            current_phase: Phase::Setup,
            status: RunStatus::InProgress,
            outputs: PhaseOutputs::default(),
            validation_attempts: 0,
            started_at: Utc::now(),
        }
    }

    /// Branch name the publish phase uses for this run's change.
    pub fn branch_name(&self, prefix: &str) -> String {
        format!("{prefix}/{}", self.work_item.id)
    }
}

/// Terminal result of a run, exposed outward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOutcome {
    pub success: bool,
    pub final_phase: Phase,
    pub pr: Option<PullRequestRef>,
    pub files_generated: usize,
    /// Validation attempts consumed.
    pub attempts: u32,
    pub error: Option<String>,
}
