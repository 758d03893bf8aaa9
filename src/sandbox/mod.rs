//! Sandboxed execution service.
//!
//! Creates an ephemeral, resource-capped Docker container, applies a
//! generated file set, and runs an ordered validation plan (clone, apply
//! files, install, lint, typecheck, test), returning structured per-phase
//! results. The container is always torn down, whatever happens.

pub mod docker_client;
pub mod files;
pub mod limits;
pub mod result;
pub mod service;

pub use docker_client::{ContainerSpec, DockerClient, ExecOutput, SANDBOX_WORKDIR};
pub use files::{
    validate_files, validate_path, FileAction, GeneratedFile, Language, RejectedFile,
    ValidatedFileSet, MAX_CONTENT_BYTES,
};
pub use limits::ResourceLimits;
pub use result::{ExecutionResult, PhaseResult, TestCounts, ValidationPhase};
pub use service::{
    ExecutionService, SandboxOutcome, SandboxRequest, SandboxService, ValidationPlan,
    DEFAULT_MAX_CONCURRENT_SANDBOXES,
};
