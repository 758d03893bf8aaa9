//! Pipeline configuration for the orchestrator.
//!
//! Covers retry budgets, human-signal timeouts, sandbox capacity, the
//! external endpoints (tracker, version-control host), and where run
//! checkpoints and response signals live on disk.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::breaker::DEFAULT_FAILURE_THRESHOLD;
use crate::gate::question::TimeoutPolicy;
use crate::gate::DEFAULT_QUESTION_TIMEOUT_SECS;
use crate::sandbox::service::DEFAULT_MAX_CONCURRENT_SANDBOXES;

/// Tracker status set when a run starts working on an item.
pub const STATUS_IN_PROGRESS: &str = "Code In Progress";
/// Tracker status set when a draft pull request is up.
pub const STATUS_REVIEW: &str = "Code Review";
/// Tracker status set on terminal failure.
pub const STATUS_FAILED: &str = "Failed";
/// Tracker status set while a question awaits a human.
pub const STATUS_BLOCKED: &str = "Blocked";

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the pipeline orchestrator.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    // Retry and breaker settings
    /// Validation-failure round-trips before escalating to a human.
    pub retry_budget: u32,
    /// Consecutive backend failures before the breaker opens.
    pub breaker_threshold: u32,

    // Human-signal settings
    /// How long a posted question waits before its default applies.
    pub question_timeout: Duration,
    /// Default-selection rule when a question times out.
    pub timeout_policy: TimeoutPolicy,
    /// Whether publishing requires an approval question first.
    pub require_approval: bool,

    // Sandbox settings
    /// Global cap on concurrently live sandboxes.
    pub max_concurrent_sandboxes: usize,

    // External endpoints
    /// Issue-tracker base URL.
    pub tracker_base_url: String,
    /// Tracker bearer token.
    pub tracker_token: Option<String>,
    /// Version-control-host base URL.
    pub vcs_base_url: String,
    /// Version-control-host bearer token.
    pub vcs_token: Option<String>,

    // Storage settings
    /// Directory for run checkpoints.
    pub state_dir: PathBuf,
    /// Directory watched for inbound response signals.
    pub signal_dir: PathBuf,

    /// Prefix for branches created by the publish phase.
    pub branch_prefix: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry_budget: 3,
            breaker_threshold: DEFAULT_FAILURE_THRESHOLD,

            question_timeout: Duration::from_secs(DEFAULT_QUESTION_TIMEOUT_SECS),
            timeout_policy: TimeoutPolicy::PreferRecommended,
            require_approval: true,

            max_concurrent_sandboxes: DEFAULT_MAX_CONCURRENT_SANDBOXES,

            tracker_base_url: "http://localhost:8080".to_string(),
            tracker_token: None,
            vcs_base_url: "http://localhost:8081".to_string(),
            vcs_token: None,

            state_dir: PathBuf::from("./state"),
            signal_dir: PathBuf::from("./signals"),

            branch_prefix: "taskpilot".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `TASKPILOT_RETRY_BUDGET`: validation retries before escalation (default: 3)
    /// - `TASKPILOT_BREAKER_THRESHOLD`: breaker trip threshold (default: 3)
    /// - `TASKPILOT_QUESTION_TIMEOUT_SECS`: question timeout (default: 86400)
    /// - `TASKPILOT_TIMEOUT_POLICY`: `recommended`|`first`|`abort` (default: recommended)
    /// - `TASKPILOT_REQUIRE_APPROVAL`: gate publishing on approval (default: true)
    /// - `TASKPILOT_MAX_SANDBOXES`: concurrent sandbox cap (default: 5)
    /// - `TRACKER_BASE_URL`: issue-tracker endpoint (required)
    /// - `TRACKER_TOKEN`: tracker bearer token (optional)
    /// - `VCS_BASE_URL`: version-control-host endpoint (required)
    /// - `VCS_TOKEN`: host bearer token (optional)
    /// - `TASKPILOT_STATE_DIR`: checkpoint directory (default: ./state)
    /// - `TASKPILOT_SIGNAL_DIR`: response-signal directory (default: ./signals)
    /// - `TASKPILOT_BRANCH_PREFIX`: branch name prefix (default: taskpilot)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or have invalid values.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("TASKPILOT_RETRY_BUDGET") {
            config.retry_budget = parse_env_value(&val, "TASKPILOT_RETRY_BUDGET")?;
        }

        if let Ok(val) = std::env::var("TASKPILOT_BREAKER_THRESHOLD") {
            config.breaker_threshold = parse_env_value(&val, "TASKPILOT_BREAKER_THRESHOLD")?;
        }

        if let Ok(val) = std::env::var("TASKPILOT_QUESTION_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "TASKPILOT_QUESTION_TIMEOUT_SECS")?;
            config.question_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("TASKPILOT_TIMEOUT_POLICY") {
            config.timeout_policy =
                val.parse()
                    .map_err(|message: String| ConfigError::InvalidValue {
                        key: "TASKPILOT_TIMEOUT_POLICY".to_string(),
                        message,
                    })?;
        }

        if let Ok(val) = std::env::var("TASKPILOT_REQUIRE_APPROVAL") {
            config.require_approval = parse_env_bool(&val, "TASKPILOT_REQUIRE_APPROVAL")?;
        }

        if let Ok(val) = std::env::var("TASKPILOT_MAX_SANDBOXES") {
            config.max_concurrent_sandboxes = parse_env_value(&val, "TASKPILOT_MAX_SANDBOXES")?;
        }

        config.tracker_base_url = std::env::var("TRACKER_BASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("TRACKER_BASE_URL".to_string()))?;
        config.tracker_token = std::env::var("TRACKER_TOKEN").ok();

        config.vcs_base_url = std::env::var("VCS_BASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("VCS_BASE_URL".to_string()))?;
        config.vcs_token = std::env::var("VCS_TOKEN").ok();

        if let Ok(val) = std::env::var("TASKPILOT_STATE_DIR") {
            config.state_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("TASKPILOT_SIGNAL_DIR") {
            config.signal_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("TASKPILOT_BRANCH_PREFIX") {
            config.branch_prefix = val;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_budget == 0 {
            return Err(ConfigError::ValidationFailed(
                "retry_budget must be greater than 0".to_string(),
            ));
        }

        if self.breaker_threshold == 0 {
            return Err(ConfigError::ValidationFailed(
                "breaker_threshold must be greater than 0".to_string(),
            ));
        }

        if self.question_timeout.as_secs() == 0 {
            return Err(ConfigError::ValidationFailed(
                "question_timeout must be greater than 0".to_string(),
            ));
        }

        if self.max_concurrent_sandboxes == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent_sandboxes must be greater than 0".to_string(),
            ));
        }

        if self.tracker_base_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "tracker_base_url cannot be empty".to_string(),
            ));
        }

        if self.vcs_base_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "vcs_base_url cannot be empty".to_string(),
            ));
        }

        if self.branch_prefix.is_empty() || self.branch_prefix.contains('/') {
            return Err(ConfigError::ValidationFailed(
                "branch_prefix must be non-empty and contain no '/'".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the retry budget.
    pub fn with_retry_budget(mut self, budget: u32) -> Self {
        self.retry_budget = budget;
        self
    }

    /// Builder method to set the breaker threshold.
    pub fn with_breaker_threshold(mut self, threshold: u32) -> Self {
        self.breaker_threshold = threshold;
        self
    }

    /// Builder method to set the question timeout.
    pub fn with_question_timeout(mut self, timeout: Duration) -> Self {
        self.question_timeout = timeout;
        self
    }

    /// Builder method to set the timeout-default policy.
    pub fn with_timeout_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.timeout_policy = policy;
        self
    }

    /// Builder method to require or skip the approval gate.
    pub fn with_require_approval(mut self, required: bool) -> Self {
        self.require_approval = required;
        self
    }

    /// Builder method to set the sandbox concurrency cap.
    pub fn with_max_concurrent_sandboxes(mut self, max: usize) -> Self {
        self.max_concurrent_sandboxes = max;
        self
    }

    /// Builder method to set the tracker endpoint.
    pub fn with_tracker(mut self, base_url: impl Into<String>, token: Option<String>) -> Self {
        self.tracker_base_url = base_url.into();
        self.tracker_token = token;
        self
    }

    /// Builder method to set the version-control-host endpoint.
    pub fn with_vcs(mut self, base_url: impl Into<String>, token: Option<String>) -> Self {
        self.vcs_base_url = base_url.into();
        self.vcs_token = token;
        self
    }

    /// Builder method to set the checkpoint directory.
    pub fn with_state_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_dir = path.into();
        self
    }

    /// Builder method to set the signal directory.
    pub fn with_signal_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.signal_dir = path.into();
        self
    }

    /// Builder method to set the branch prefix.
    pub fn with_branch_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.branch_prefix = prefix.into();
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.retry_budget, 3);
        assert_eq!(config.breaker_threshold, 3);
        assert_eq!(config.question_timeout, Duration::from_secs(86400));
        assert_eq!(config.timeout_policy, TimeoutPolicy::PreferRecommended);
        assert!(config.require_approval);
        assert_eq!(config.max_concurrent_sandboxes, 5);
    }

    #[test]
    fn test_config_builder() {
        let config = PipelineConfig::new()
            .with_retry_budget(5)
            .with_breaker_threshold(10)
            .with_question_timeout(Duration::from_secs(3600))
            .with_timeout_policy(TimeoutPolicy::AlwaysAbort)
            .with_require_approval(false)
            .with_max_concurrent_sandboxes(2)
            .with_tracker("http://tracker.local", Some("t".to_string()))
            .with_vcs("http://vcs.local", None)
            .with_branch_prefix("bot");

        assert_eq!(config.retry_budget, 5);
        assert_eq!(config.breaker_threshold, 10);
        assert_eq!(config.question_timeout, Duration::from_secs(3600));
        assert_eq!(config.timeout_policy, TimeoutPolicy::AlwaysAbort);
        assert!(!config.require_approval);
        assert_eq!(config.max_concurrent_sandboxes, 2);
        assert_eq!(config.tracker_base_url, "http://tracker.local");
        assert_eq!(config.vcs_base_url, "http://vcs.local");
        assert_eq!(config.branch_prefix, "bot");
    }

    #[test]
    fn test_validation_valid_config() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validation_zero_retry_budget() {
        let result = PipelineConfig::default().with_retry_budget(0).validate();
        assert!(result.unwrap_err().to_string().contains("retry_budget"));
    }

    #[test]
    fn test_validation_zero_sandboxes() {
        let result = PipelineConfig::default()
            .with_max_concurrent_sandboxes(0)
            .validate();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("max_concurrent_sandboxes"));
    }

    #[test]
    fn test_validation_zero_question_timeout() {
        let result = PipelineConfig::default()
            .with_question_timeout(Duration::from_secs(0))
            .validate();
        assert!(result.unwrap_err().to_string().contains("question_timeout"));
    }

    #[test]
    fn test_validation_branch_prefix_rules() {
        assert!(PipelineConfig::default()
            .with_branch_prefix("")
            .validate()
            .is_err());
        assert!(PipelineConfig::default()
            .with_branch_prefix("a/b")
            .validate()
            .is_err());
    }

    #[test]
    fn test_parse_env_bool() {
        assert!(parse_env_bool("true", "test").unwrap());
        assert!(parse_env_bool("1", "test").unwrap());
        assert!(parse_env_bool("YES", "test").unwrap());
        assert!(!parse_env_bool("off", "test").unwrap());
        assert!(parse_env_bool("invalid", "test").is_err());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::MissingEnvVar("TRACKER_BASE_URL".to_string());
        assert!(err.to_string().contains("TRACKER_BASE_URL"));

        let err = ConfigError::InvalidValue {
            key: "KEY".to_string(),
            message: "bad value".to_string(),
        };
        assert!(err.to_string().contains("KEY"));
        assert!(err.to_string().contains("bad value"));
    }
}
