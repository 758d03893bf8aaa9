//! Error types for taskpilot operations.
//!
//! Defines error types for the major subsystems:
//! - Sandboxed execution (Docker container lifecycle)
//! - Generation backend interactions
//! - Issue-tracker and version-control-host clients
//! - Human-signal gating
//! - Checkpoint persistence

use thiserror::Error;

/// Errors that can occur during sandboxed execution.
///
/// `Capacity` is retryable by policy; everything else is either a system
/// fault or a security rejection, which is never retried.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Docker daemon not available: {0}")]
    DaemonUnavailable(String),

    #[error("Failed to provision sandbox: {0}")]
    ProvisionFailed(String),

    #[error("Sandbox command failed: {0}")]
    ExecFailed(String),

    #[error("Failed to copy files into sandbox: {0}")]
    CopyFailed(String),

    #[error("Sandbox capacity exhausted: all {limit} slots in use")]
    Capacity { limit: usize },

    #[error("Sandbox execution exceeded overall budget of {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("No valid files remain after path validation")]
    NoValidFiles,

    #[error("Container '{id}' not found")]
    ContainerNotFound { id: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Whether the error is transient and worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SandboxError::Capacity { .. })
    }
}

/// Errors that can occur when talking to the generation backend.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API base URL: BACKEND_API_BASE environment variable not set")]
    MissingApiBase,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse backend response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error(
        "Circuit breaker open: {consecutive_failures} consecutive failures (threshold {threshold})"
    )]
    CircuitOpen {
        consecutive_failures: u32,
        threshold: u32,
    },
}

impl LlmError {
    /// Whether the error is transient (network or throttling).
    pub fn is_retryable(&self) -> bool {
        matches!(self, LlmError::RequestFailed(_) | LlmError::RateLimited(_))
            || matches!(self, LlmError::ApiError { code, .. } if *code >= 500)
    }
}

/// Errors from the issue-tracker client.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Work item '{0}' not found")]
    WorkItemNotFound(String),

    #[error("Tracker request failed: {0}")]
    RequestFailed(String),

    #[error("Tracker API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Failed to parse tracker response: {0}")]
    ParseError(String),
}

/// Errors from the version-control-host client.
#[derive(Debug, Error)]
pub enum VcsError {
    #[error("Invalid branch name '{name}': {reason}")]
    InvalidBranchName { name: String, reason: String },

    #[error("VCS request failed: {0}")]
    RequestFailed(String),

    #[error("VCS API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Failed to parse VCS response: {0}")]
    ParseError(String),
}

/// Errors from the human-signal gate.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("Failed to post question to tracker: {0}")]
    PostFailed(#[from] TrackerError),

    #[error("Question '{0}' has no options to resolve against")]
    NoOptions(uuid::Uuid),

    #[error("Signal wait cancelled")]
    Cancelled,
}

/// Errors from checkpoint persistence.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint for run '{0}' not found")]
    NotFound(uuid::Uuid),

    #[error("Checkpoint checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
