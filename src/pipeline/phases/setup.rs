//! Setup and context-retrieval phases.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{PhaseError, PhaseStep, StepOutcome};
use crate::clients::tracker::TrackerClient;
use crate::llm::client::GenerationBackend;
use crate::llm::parse::{extract_json, ParseOutcome};
use crate::pipeline::config::STATUS_IN_PROGRESS;
use crate::pipeline::state::{Phase, PipelineRun};

/// Claims the work item on the tracker.
///
/// Status updates are safe to repeat, so re-entering this phase after
/// a crash is harmless.
pub struct SetupPhase {
    tracker: Arc<dyn TrackerClient>,
}

impl SetupPhase {
    pub fn new(tracker: Arc<dyn TrackerClient>) -> Self {
        Self { tracker }
    }
}

#[async_trait]
impl PhaseStep for SetupPhase {
    fn phase(&self) -> Phase {
        Phase::Setup
    }

    fn max_attempts(&self) -> u32 {
        3
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(60)
    }

    async fn execute(&self, run: &mut PipelineRun) -> Result<StepOutcome, PhaseError> {
        self.tracker
            .update_status(&run.work_item.id, STATUS_IN_PROGRESS)
            .await?;
        self.tracker
            .post_comment(
                &run.work_item.id,
                &format!("Automated implementation started (run {}).", run.id),
            )
            .await?;

        Ok(StepOutcome::Continue)
    }
}

const CONTEXT_SYSTEM_PROMPT: &str = "You are a senior engineer preparing to implement a tracked \
work item. Summarize the requirements, constraints, and acceptance criteria as a concise brief \
for the implementer. Respond with JSON: {\"summary\": \"...\"}.";

/// Distills the work item into an implementation brief.
pub struct ContextPhase {
    backend: Arc<dyn GenerationBackend>,
}

impl ContextPhase {
    pub fn new(backend: Arc<dyn GenerationBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl PhaseStep for ContextPhase {
    fn phase(&self) -> Phase {
        Phase::ContextRetrieval
    }

    fn max_attempts(&self) -> u32 {
        3
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(240)
    }

    async fn execute(&self, run: &mut PipelineRun) -> Result<StepOutcome, PhaseError> {
        let user_prompt = format!(
            "Work item {id} in {repo} (base branch {base}).\n\nTitle: {title}\n\n{description}",
            id = run.work_item.id,
            repo = run.work_item.repository,
            base = run.work_item.base_branch,
            title = run.work_item.title,
            description = run.work_item.description,
        );

        let completion = self
            .backend
            .generate(CONTEXT_SYSTEM_PROMPT, &user_prompt)
            .await?;

        // A brief is useful but not load-bearing; an unstructured reply
        // is kept verbatim rather than failing the run.
        let summary = match extract_json(&completion.content) {
            ParseOutcome::Parsed(value) => value
                .get("summary")
                .and_then(|s| s.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| completion.content.trim().to_string()),
            ParseOutcome::Unparseable(raw) => raw.trim().to_string(),
        };

        tracing::debug!(run_id = %run.id, summary_chars = summary.len(), "context brief ready");
        run.outputs.context_summary = Some(summary);
        Ok(StepOutcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::clients::tracker::WorkItem;
    use crate::error::TrackerError;
    use crate::gate::question::Question;
    use crate::llm::client::{Completion, TokenUsage};
    use uuid::Uuid;

    struct LogTracker {
        statuses: Mutex<Vec<String>>,
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
            Ok(question.id)
        }
    }

    struct FixedBackend(String);

    #[async_trait]
    impl GenerationBackend for FixedBackend {
        async fn generate(
            &self,
            _system: &str,
            _user: &str,
        ) -> Result<Completion, crate::error::LlmError> {
            Ok(Completion {
                content: self.0.clone(),
                usage: TokenUsage::default(),
            })
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

    #[tokio::test]
    async fn test_setup_claims_work_item() {
        let tracker = Arc::new(LogTracker {
            statuses: Mutex::new(Vec::new()),
        });
        let mut run = sample_run();

        let outcome = SetupPhase::new(tracker.clone())
            .execute(&mut run)
            .await
            .unwrap();
        assert_eq!(outcome, StepOutcome::Continue);
        assert_eq!(
            tracker.statuses.lock().unwrap().as_slice(),
            [STATUS_IN_PROGRESS.to_string()]
        );
    }

    #[tokio::test]
    async fn test_context_extracts_structured_summary() {
        let backend = Arc::new(FixedBackend(
            r#"{"summary": "Throttle per client using a token bucket."}"#.to_string(),
        ));
        let mut run = sample_run();

        ContextPhase::new(backend).execute(&mut run).await.unwrap();
        assert_eq!(
            run.outputs.context_summary.as_deref(),
            Some("Throttle per client using a token bucket.")
        );
    }

    #[tokio::test]
    async fn test_context_keeps_unstructured_reply() {
        let backend = Arc::new(FixedBackend("Just throttle per client.".to_string()));
        let mut run = sample_run();

        ContextPhase::new(backend).execute(&mut run).await.unwrap();
        assert_eq!(
            run.outputs.context_summary.as_deref(),
            Some("Just throttle per client.")
        );
    }
}
