//! Generation phase.
//!
//! Asks the backend for a technical plan and a file-change set. The
//! prompt carries everything accumulated so far: the context brief,
//! human clarifications, a chosen fix from solution resolution, and
//! the tail of the last validation failure when this is a retry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{PhaseError, PhaseStep, StepOutcome};
use crate::llm::client::GenerationBackend;
use crate::llm::parse::extract_json;
use crate::pipeline::state::{Phase, PipelineRun};
use crate::sandbox::files::{FileAction, GeneratedFile};

pub const GENERATION_SYSTEM_PROMPT: &str = "You are an expert software engineer implementing a \
tracked work item. Respond with JSON only:\n\
{\"plan\": \"technical plan\", \"files\": [{\"path\": \"relative/path\", \"content\": \"...\", \
\"action\": \"create|modify|delete\"}], \"ambiguities\": [\"unclear requirement\", ...]}\n\
Paths must be relative to the repository root. List an ambiguity only when the requirement \
genuinely cannot be resolved from the given context.";

/// How much of a failing phase's output is quoted back to the backend.
const FAILURE_TAIL_CHARS: usize = 4000;

/// Structured body of a generation response.
#[derive(Debug, Deserialize)]
struct GenerationPayload {
    #[serde(default)]
    plan: String,
    #[serde(default)]
    files: Vec<PayloadFile>,
    #[serde(default)]
    ambiguities: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PayloadFile {
    path: String,
    #[serde(default)]
    content: String,
    action: FileAction,
}

/// Produces the technical plan and file set.
pub struct GeneratePhase {
    backend: Arc<dyn GenerationBackend>,
}

impl GeneratePhase {
    pub fn new(backend: Arc<dyn GenerationBackend>) -> Self {
        Self { backend }
    }

    fn build_prompt(run: &PipelineRun) -> String {
        let mut prompt = format!(
            "Work item {id} in {repo} (base branch {base}).\n\nTitle: {title}\n\n{description}\n",
            id = run.work_item.id,
            repo = run.work_item.repository,
            base = run.work_item.base_branch,
            title = run.work_item.title,
            description = run.work_item.description,
        );

        if let Some(ref summary) = run.outputs.context_summary {
            prompt.push_str(&format!("\nContext brief:\n{summary}\n"));
        }

        if !run.outputs.clarifications.is_empty() {
            prompt.push_str("\nHuman clarifications:\n");
            for clarification in &run.outputs.clarifications {
                prompt.push_str(&format!("- {clarification}\n"));
            }
        }

        if let Some(ref fix) = run.outputs.chosen_fix {
            prompt.push_str(&format!("\nApply this fix approach:\n{fix}\n"));
        }

        if let Some(ref result) = run.outputs.execution_result {
            if !result.success {
                prompt.push_str(&format!(
                    "\nYour previous attempt failed validation in the '{}' phase. Output tail:\n{}\n\
                     Produce a corrected file set.\n",
                    result
                        .failed_phase
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "unknown".to_string()),
                    result.failure_tail(FAILURE_TAIL_CHARS).unwrap_or_default(),
                ));
            }
        }

        prompt
    }
}

#[async_trait]
impl PhaseStep for GeneratePhase {
    fn phase(&self) -> Phase {
        Phase::Generate
    }

    fn max_attempts(&self) -> u32 {
        3
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(600)
    }

    async fn execute(&self, run: &mut PipelineRun) -> Result<StepOutcome, PhaseError> {
        let user_prompt = Self::build_prompt(run);
        let completion = self
            .backend
            .generate(GENERATION_SYSTEM_PROMPT, &user_prompt)
            .await?;

        let payload: GenerationPayload = extract_json(&completion.content)
            .deserialize()
            .map_err(PhaseError::MalformedResponse)?;

        if payload.files.is_empty() {
            return Err(PhaseError::MalformedResponse(
                "generation produced no files".to_string(),
            ));
        }

        tracing::info!(
            run_id = %run.id,
            files = payload.files.len(),
            ambiguities = payload.ambiguities.len(),
            tokens = completion.usage.total_tokens,
            "generation complete"
        );

        run.outputs.technical_plan = Some(payload.plan);
        run.outputs.files = payload
            .files
            .into_iter()
            .map(|f| GeneratedFile::new(f.path, f.content, f.action))
            .collect();
        run.outputs.ambiguities = payload.ambiguities;

        Ok(StepOutcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::tracker::WorkItem;
    use crate::error::LlmError;
    use crate::llm::client::{Completion, TokenUsage};
    use crate::sandbox::files::Language;
    use crate::sandbox::result::{ExecutionResult, PhaseResult, ValidationPhase};

    struct FixedBackend(String);

    #[async_trait]
    impl GenerationBackend for FixedBackend {
        async fn generate(&self, _system: &str, _user: &str) -> Result<Completion, LlmError> {
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
    async fn test_parses_plan_files_and_ambiguities() {
        let backend = Arc::new(FixedBackend(
            r#"```json
{"plan": "Add a middleware.", "files": [{"path": "src/limit.ts", "content": "x", "action": "create"}], "ambiguities": ["per-IP or per-token?"]}
```"#
                .to_string(),
        ));
        let mut run = sample_run();

        GeneratePhase::new(backend).execute(&mut run).await.unwrap();

        assert_eq!(run.outputs.technical_plan.as_deref(), Some("Add a middleware."));
        assert_eq!(run.outputs.files.len(), 1);
        assert_eq!(run.outputs.files[0].language, Language::TypeScript);
        assert_eq!(run.outputs.ambiguities, vec!["per-IP or per-token?"]);
    }

    #[tokio::test]
    async fn test_unparseable_response_is_fatal_not_empty_success() {
        let backend = Arc::new(FixedBackend("I cannot produce code today.".to_string()));
        let mut run = sample_run();

        let err = GeneratePhase::new(backend)
            .execute(&mut run)
            .await
            .unwrap_err();
        assert!(matches!(err, PhaseError::MalformedResponse(_)));
        assert!(run.outputs.files.is_empty());
    }

    #[tokio::test]
    async fn test_empty_file_set_is_malformed() {
        let backend = Arc::new(FixedBackend(
            r#"{"plan": "nothing to do", "files": []}"#.to_string(),
        ));
        let mut run = sample_run();

        let err = GeneratePhase::new(backend)
            .execute(&mut run)
            .await
            .unwrap_err();
        assert!(matches!(err, PhaseError::MalformedResponse(_)));
    }

    #[test]
    fn test_retry_prompt_carries_failure_tail_and_fix() {
        let mut run = sample_run();
        run.outputs.chosen_fix = Some("Fix the import path.".to_string());
        run.outputs.execution_result = Some(ExecutionResult::from_phases(vec![
            PhaseResult::ok(
                ValidationPhase::Clone,
                "done",
                std::time::Duration::from_millis(10),
            ),
            PhaseResult::failed(
                ValidationPhase::Test,
                1,
                "expected 429, got 200",
                std::time::Duration::from_millis(900),
            ),
        ]));

        let prompt = GeneratePhase::build_prompt(&run);
        assert!(prompt.contains("failed validation in the 'test' phase"));
        assert!(prompt.contains("expected 429, got 200"));
        assert!(prompt.contains("Fix the import path."));
    }
}
