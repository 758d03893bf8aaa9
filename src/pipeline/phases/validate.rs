//! Validation phase.
//!
//! Runs the generated file set through the sandbox and, on failure,
//! enriches the result with a backend-produced failure analysis. The
//! analysis is best-effort: an unparseable analysis degrades to the raw
//! failure tail rather than failing the phase, because retry routing
//! only needs the structured sandbox result.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{PhaseError, PhaseStep, StepOutcome};
use crate::llm::client::GenerationBackend;
use crate::llm::parse::{extract_json, ParseOutcome};
use crate::pipeline::state::{FailureAnalysis, Phase, PipelineRun};
use crate::sandbox::files::Language;
use crate::sandbox::limits::ResourceLimits;
use crate::sandbox::service::{ExecutionService, SandboxRequest, ValidationPlan};
use crate::secrets::CredentialSet;

const ANALYSIS_SYSTEM_PROMPT: &str = "You are a senior engineer triaging a failed validation \
run. Diagnose the failure and list the viable fixes. Respond with JSON only:\n\
{\"summary\": \"diagnosis\", \"candidate_fixes\": [{\"id\": \"short-id\", \"label\": \"...\", \
\"description\": \"...\", \"recommended\": true|false}]}\n\
List more than one fix only when several approaches are genuinely viable.";

const ANALYSIS_TAIL_CHARS: usize = 6000;

/// Validates the generated file set in a sandbox.
pub struct ValidatePhase {
    sandbox: Arc<dyn ExecutionService>,
    backend: Arc<dyn GenerationBackend>,
    limits: ResourceLimits,
    credentials: CredentialSet,
}

impl ValidatePhase {
    pub fn new(
        sandbox: Arc<dyn ExecutionService>,
        backend: Arc<dyn GenerationBackend>,
        limits: ResourceLimits,
        credentials: CredentialSet,
    ) -> Self {
        Self {
            sandbox,
            backend,
            limits,
            credentials,
        }
    }

    /// Dominant language of the file set, by file count.
    fn dominant_language(run: &PipelineRun) -> Language {
        let mut counts: Vec<(Language, usize)> = Vec::new();
        for file in &run.outputs.files {
            match counts.iter_mut().find(|(l, _)| *l == file.language) {
                Some((_, n)) => *n += 1,
                None => counts.push((file.language, 1)),
            }
        }
        counts
            .into_iter()
            .max_by_key(|(_, n)| *n)
            .map(|(l, _)| l)
            .unwrap_or(Language::Other)
    }

    /// Default validation commands per language.
    fn plan_for(run: &PipelineRun, language: Language) -> ValidationPlan {
        let repo = &run.work_item.repository;
        let repo_url = if repo.contains("://") {
            repo.clone()
        } else {
            format!("https://github.com/{repo}.git")
        };

        let (install, lint, typecheck, test) = match language {
            Language::TypeScript => (
                Some("npm ci || npm install"),
                Some("npm run lint --if-present"),
                Some("npx tsc --noEmit"),
                Some("npm test --if-present"),
            ),
            Language::JavaScript => (
                Some("npm ci || npm install"),
                Some("npm run lint --if-present"),
                None,
                Some("npm test --if-present"),
            ),
            Language::Python => (
                Some("pip install -r requirements.txt || true"),
                Some("ruff check . || true"),
                None,
                Some("pytest -x"),
            ),
            Language::Rust => (
                None,
                Some("cargo clippy --no-deps -- -D warnings"),
                Some("cargo check"),
                Some("cargo test"),
            ),
            Language::Go => (
                Some("go mod download"),
                Some("go vet ./..."),
                None,
                Some("go test ./..."),
            ),
            Language::Other => (None, None, None, None),
        };

        ValidationPlan {
            repo_url: Some(repo_url),
            base_branch: Some(run.work_item.base_branch.clone()),
            install: install.map(String::from),
            lint: lint.map(String::from),
            typecheck: typecheck.map(String::from),
            test: test.map(String::from),
        }
    }

    async fn analyze_failure(&self, run: &PipelineRun) -> FailureAnalysis {
        let result = match run.outputs.execution_result {
            Some(ref r) if !r.success => r,
            _ => return FailureAnalysis::default(),
        };

        let tail = result
            .failure_tail(ANALYSIS_TAIL_CHARS)
            .unwrap_or_default();
        let fallback = FailureAnalysis {
            summary: tail.clone(),
            candidate_fixes: Vec::new(),
        };

        let user_prompt = format!(
            "Work item: {title}\n\nPlan:\n{plan}\n\nFailed phase: {phase}\nOutput tail:\n{tail}",
            title = run.work_item.title,
            plan = run.outputs.technical_plan.as_deref().unwrap_or("(none)"),
            phase = result
                .failed_phase
                .map(|p| p.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        );

        let completion = match self
            .backend
            .generate(ANALYSIS_SYSTEM_PROMPT, &user_prompt)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(run_id = %run.id, error = %e, "failure analysis unavailable");
                return fallback;
            }
        };

        match extract_json(&completion.content) {
            ParseOutcome::Parsed(value) => match serde_json::from_value(value) {
                Ok(analysis) => analysis,
                Err(e) => {
                    tracing::warn!(run_id = %run.id, error = %e, "failure analysis malformed");
                    fallback
                }
            },
            ParseOutcome::Unparseable(_) => fallback,
        }
    }
}

#[async_trait]
impl PhaseStep for ValidatePhase {
    fn phase(&self) -> Phase {
        Phase::Validate
    }

    // Capacity rejections are retryable; give them room to drain.
    fn max_attempts(&self) -> u32 {
        4
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.limits.overall_timeout_secs + 120)
    }

    async fn execute(&self, run: &mut PipelineRun) -> Result<StepOutcome, PhaseError> {
        let language = Self::dominant_language(run);
        let request = SandboxRequest {
            run_id: run.id,
            files: run.outputs.files.clone(),
            plan: Self::plan_for(run, language),
            limits: self.limits.clone(),
            credentials: self.credentials.clone(),
            language,
        };

        let outcome = self.sandbox.execute(request).await?;

        tracing::info!(
            run_id = %run.id,
            success = outcome.result.success,
            failed_phase = ?outcome.result.failed_phase,
            applied = outcome.applied_files,
            rejected = outcome.rejected_files.len(),
            "sandbox run complete"
        );

        run.outputs.execution_result = Some(outcome.result);

        if run
            .outputs
            .execution_result
            .as_ref()
            .is_some_and(|r| !r.success)
        {
            let analysis = self.analyze_failure(run).await;
            run.outputs.failure_analysis = Some(analysis);
        } else {
            run.outputs.failure_analysis = None;
        }

        // Validation failures are data; the orchestrator owns routing.
        Ok(StepOutcome::Continue)
    }
}
