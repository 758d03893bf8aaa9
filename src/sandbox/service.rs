//! Sandboxed execution service.
//!
//! Runs a generated file set through an ordered validation plan inside an
//! ephemeral, resource-capped container. Phases short-circuit at the
//! first failure; the container is torn down on every exit path; all
//! captured output is masked before it leaves this module.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::error::SandboxError;
use crate::sandbox::docker_client::{ContainerSpec, DockerClient, SANDBOX_WORKDIR};
use crate::sandbox::files::{
    validate_files, FileAction, GeneratedFile, Language, RejectedFile,
};
use crate::sandbox::limits::ResourceLimits;
use crate::sandbox::result::{ExecutionResult, PhaseResult, ValidationPhase};
use crate::secrets::{CredentialSet, SecretMasker};

/// Default global cap on concurrently live sandboxes.
pub const DEFAULT_MAX_CONCURRENT_SANDBOXES: usize = 5;

/// Validation commands for one sandbox run.
///
/// `clone` and file application are implicit; the optional phases run
/// only when a command is provided.
#[derive(Debug, Clone, Default)]
pub struct ValidationPlan {
    /// Repository to clone. When absent the workspace starts empty.
    pub repo_url: Option<String>,
    /// Branch to check out after cloning.
    pub base_branch: Option<String>,
    /// Dependency installation command (e.g., "npm ci").
    pub install: Option<String>,
    /// Lint command (optional phase).
    pub lint: Option<String>,
    /// Type-check command (optional phase).
    pub typecheck: Option<String>,
    /// Test command (optional phase).
    pub test: Option<String>,
}

/// One request to the execution service.
#[derive(Debug, Clone)]
pub struct SandboxRequest {
    /// Run this sandbox belongs to; used for container naming.
    pub run_id: Uuid,
    /// Generated files to apply. Validated (and possibly partially
    /// dropped) before anything runs.
    pub files: Vec<GeneratedFile>,
    /// Commands to run, in phase order.
    pub plan: ValidationPlan,
    /// Resource caps for the container.
    pub limits: ResourceLimits,
    /// Credentials injected into the container environment. Their values
    /// are masked out of all captured output.
    pub credentials: CredentialSet,
    /// Dominant language, drives base image selection.
    pub language: Language,
}

/// Outcome of a sandbox run, including which files were dropped during
/// validation.
#[derive(Debug, Clone)]
pub struct SandboxOutcome {
    pub result: ExecutionResult,
    pub rejected_files: Vec<RejectedFile>,
    pub applied_files: usize,
}

/// Seam for the orchestrator: anything that can validate a file set.
#[async_trait]
pub trait ExecutionService: Send + Sync {
    /// Executes the validation plan. `Err` means the sandbox itself
    /// failed (capacity, daemon down); validation failures come back as
    /// data inside `SandboxOutcome`.
    async fn execute(&self, request: SandboxRequest) -> Result<SandboxOutcome, SandboxError>;
}

/// Removes a provisioned container even if the owning future is dropped
/// mid-run (caller timeout, task abort, process shutdown).
///
/// The normal path consumes the guard with [`teardown`](Self::teardown);
/// the drop path spawns the removal on the current runtime.
struct TeardownGuard {
    docker: Arc<DockerClient>,
    container_id: Option<String>,
}

impl TeardownGuard {
    fn new(docker: Arc<DockerClient>, container_id: String) -> Self {
        Self {
            docker,
            container_id: Some(container_id),
        }
    }

    /// Tears the container down inline and disarms the guard.
    async fn teardown(mut self) {
        if let Some(id) = self.container_id.take() {
            if let Err(e) = self.docker.teardown(&id).await {
                tracing::warn!(container = %id, error = %e, "sandbox teardown failed");
            }
        }
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        let Some(id) = self.container_id.take() else {
            return;
        };
        let docker = self.docker.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = docker.teardown(&id).await {
                        tracing::warn!(
                            container = %id,
                            error = %e,
                            "sandbox teardown after dropped run failed"
                        );
                    }
                });
            }
            Err(_) => {
                tracing::warn!(container = %id, "no runtime at drop, sandbox not removed");
            }
        }
    }
}

/// Docker-backed execution service with a global concurrency cap.
pub struct SandboxService {
    docker: Arc<DockerClient>,
    slots: Arc<Semaphore>,
    max_slots: usize,
}

impl SandboxService {
    /// Creates a service over the given Docker client.
    pub fn new(docker: Arc<DockerClient>, max_concurrent: usize) -> Self {
        let max_slots = max_concurrent.max(1);
        Self {
            docker,
            slots: Arc::new(Semaphore::new(max_slots)),
            max_slots,
        }
    }

    /// Number of currently available sandbox slots.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Runs all phases inside an already-provisioned container.
    ///
    /// Never tears the container down itself; the caller owns cleanup so
    /// it happens exactly once on every path.
    async fn run_phases(
        &self,
        container_id: &str,
        request: &SandboxRequest,
        files: &[GeneratedFile],
        masker: &SecretMasker,
    ) -> Result<Vec<PhaseResult>, SandboxError> {
        let limits = &request.limits;
        let mut phases = Vec::new();

        // Phase: clone.
        let clone_result = self
            .run_clone_phase(container_id, &request.plan, limits, masker)
            .await?;
        let clone_ok = clone_result.success;
        phases.push(clone_result);
        if !clone_ok {
            return Ok(phases);
        }

        // Phase: apply files.
        let apply_result = self
            .run_apply_phase(container_id, files, masker)
            .await?;
        let apply_ok = apply_result.success;
        phases.push(apply_result);
        if !apply_ok {
            return Ok(phases);
        }

        // Remaining phases: install, lint, typecheck, test. Optional
        // phases with no command are skipped without a phase entry.
        let command_phases: [(ValidationPhase, &Option<String>, u64); 4] = [
            (
                ValidationPhase::Install,
                &request.plan.install,
                limits.heavy_phase_timeout_secs(),
            ),
            (
                ValidationPhase::Lint,
                &request.plan.lint,
                limits.quick_phase_timeout_secs(),
            ),
            (
                ValidationPhase::Typecheck,
                &request.plan.typecheck,
                limits.quick_phase_timeout_secs(),
            ),
            (
                ValidationPhase::Test,
                &request.plan.test,
                limits.heavy_phase_timeout_secs(),
            ),
        ];

        for (phase, command, timeout_secs) in command_phases {
            let Some(command) = command else { continue };

            let result = self
                .run_command_phase(container_id, phase, command, timeout_secs, masker)
                .await?;
            let success = result.success;
            phases.push(result);

            if !success {
                // First failure short-circuits every later phase.
                break;
            }
        }

        Ok(phases)
    }

    async fn run_clone_phase(
        &self,
        container_id: &str,
        plan: &ValidationPlan,
        limits: &ResourceLimits,
        masker: &SecretMasker,
    ) -> Result<PhaseResult, SandboxError> {
        let command = match (&plan.repo_url, &plan.base_branch) {
            (Some(url), Some(branch)) => {
                format!("git clone --depth 1 --branch '{branch}' '{url}' .")
            }
            (Some(url), None) => format!("git clone --depth 1 '{url}' ."),
            (None, _) => "git init -q .".to_string(),
        };

        self.run_command_phase(
            container_id,
            ValidationPhase::Clone,
            &command,
            limits.heavy_phase_timeout_secs(),
            masker,
        )
        .await
    }

    /// Applies the validated file set: deletes via exec, creates and
    /// modifications via one tar upload (parent directories come along
    /// in the archive).
    async fn run_apply_phase(
        &self,
        container_id: &str,
        files: &[GeneratedFile],
        masker: &SecretMasker,
    ) -> Result<PhaseResult, SandboxError> {
        let started = Instant::now();
        let mut log = String::new();

        let writes: Vec<&GeneratedFile> = files
            .iter()
            .filter(|f| f.action != FileAction::Delete)
            .collect();
        let deletes: Vec<&GeneratedFile> = files
            .iter()
            .filter(|f| f.action == FileAction::Delete)
            .collect();

        if !writes.is_empty() {
            let archive = build_archive(&writes)?;
            if let Err(e) = self
                .docker
                .upload_archive(container_id, SANDBOX_WORKDIR, archive)
                .await
            {
                return Ok(PhaseResult::failed(
                    ValidationPhase::ApplyFiles,
                    1,
                    masker.mask(&format!("{log}upload failed: {e}")),
                    started.elapsed(),
                ));
            }
            for file in &writes {
                log.push_str(&format!("{} {}\n", file.action, file.path));
            }
        }

        for file in &deletes {
            let exec = self
                .docker
                .exec_shell(container_id, &format!("rm -f -- '{}'", file.path))
                .await?;
            log.push_str(&format!("delete {}\n", file.path));
            if exec.exit_code != 0 {
                log.push_str(&exec.output);
                return Ok(PhaseResult::failed(
                    ValidationPhase::ApplyFiles,
                    exec.exit_code,
                    masker.mask(&log),
                    started.elapsed(),
                ));
            }
        }

        Ok(PhaseResult::ok(
            ValidationPhase::ApplyFiles,
            masker.mask(&log),
            started.elapsed(),
        ))
    }

    async fn run_command_phase(
        &self,
        container_id: &str,
        phase: ValidationPhase,
        command: &str,
        timeout_secs: u64,
        masker: &SecretMasker,
    ) -> Result<PhaseResult, SandboxError> {
        let started = Instant::now();
        tracing::debug!(%phase, command, timeout_secs, "running sandbox phase");

        let exec = tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            self.docker.exec_shell(container_id, command),
        )
        .await;

        let result = match exec {
            Ok(Ok(output)) => {
                let masked = masker.mask(&output.output);
                if output.exit_code == 0 {
                    PhaseResult::ok(phase, masked, started.elapsed())
                } else {
                    PhaseResult::failed(phase, output.exit_code, masked, started.elapsed())
                }
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => PhaseResult::failed(
                phase,
                -1,
                format!("phase timed out after {timeout_secs}s"),
                started.elapsed(),
            ),
        };

        tracing::debug!(%phase, success = result.success, duration_ms = result.duration_ms, "sandbox phase finished");
        Ok(result)
    }
}

#[async_trait]
impl ExecutionService for SandboxService {
    async fn execute(&self, request: SandboxRequest) -> Result<SandboxOutcome, SandboxError> {
        // Capacity gate: saturation is a retryable error, not a queue.
        let _permit = self
            .slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| SandboxError::Capacity {
                limit: self.max_slots,
            })?;

        let validated = validate_files(request.files.clone());
        if validated.accepted.is_empty() && !request.files.is_empty() {
            return Err(SandboxError::NoValidFiles);
        }

        let masker = request.credentials.masker();
        let spec = ContainerSpec::new(
            format!("taskpilot-sbx-{}", request.run_id),
            request.language.base_image(),
        )
        .with_env(request.credentials.env_vars())
        .with_limits(request.limits.clone());

        let container_id = self.docker.provision(&spec).await?;
        tracing::info!(run_id = %request.run_id, container = %container_id, "sandbox provisioned");
        let guard = TeardownGuard::new(self.docker.clone(), container_id.clone());

        // Everything after provisioning runs under an overall budget, and
        // the guard removes the container no matter how it ends,
        // including this future being dropped mid-phase.
        let phases_result = tokio::time::timeout(
            Duration::from_secs(request.limits.overall_timeout_secs),
            self.run_phases(&container_id, &request, &validated.accepted, &masker),
        )
        .await;

        guard.teardown().await;

        let phases = match phases_result {
            Ok(Ok(phases)) => phases,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(SandboxError::Timeout {
                    seconds: request.limits.overall_timeout_secs,
                })
            }
        };

        let result = ExecutionResult::from_phases(phases);
        tracing::info!(
            run_id = %request.run_id,
            success = result.success,
            failed_phase = result.failed_phase.map(|p| p.as_str()),
            "sandbox run finished"
        );

        Ok(SandboxOutcome {
            applied_files: validated.accepted.len(),
            rejected_files: validated.rejected,
            result,
        })
    }
}

/// Builds an uncompressed tar archive of the files to write, including
/// their parent directories.
fn build_archive(files: &[&GeneratedFile]) -> Result<Vec<u8>, SandboxError> {
    let mut builder = tar::Builder::new(Vec::new());

    for file in files {
        let data = file.content.as_bytes();
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, &file.path, data)
            .map_err(|e| SandboxError::CopyFailed(format!("tar append failed: {e}")))?;
    }

    builder
        .into_inner()
        .map_err(|e| SandboxError::CopyFailed(format!("tar finalize failed: {e}")))
}
