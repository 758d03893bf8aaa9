//! Version-control-host client.
//!
//! Branch creation tolerates "already exists" so the publish phase is
//! safely re-enterable after a crash. Pull requests are always created
//! in draft state; that is a fixed safety invariant, not a setting.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::VcsError;
use crate::sandbox::files::GeneratedFile;

/// Reference to a created pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestRef {
    pub number: u64,
    pub url: String,
    pub draft: bool,
}

/// Version-control operations the publish phase depends on.
#[async_trait]
pub trait VcsClient: Send + Sync {
    /// Creates a branch off `base`. Succeeds if the branch already
    /// exists.
    async fn create_branch(&self, repo: &str, name: &str, base: &str) -> Result<(), VcsError>;

    /// Commits the file set to the branch with the given message.
    async fn commit_files(
        &self,
        repo: &str,
        branch: &str,
        files: &[GeneratedFile],
        message: &str,
    ) -> Result<(), VcsError>;

    /// Opens a draft pull request and returns its reference.
    async fn create_pull_request(
        &self,
        repo: &str,
        branch: &str,
        title: &str,
        description: &str,
        labels: &[String],
    ) -> Result<PullRequestRef, VcsError>;
}

/// Validates a branch name before it reaches the host API.
///
/// Security rejection: a malformed name is dropped, never retried.
pub fn validate_branch_name(name: &str) -> Result<(), VcsError> {
    let reject = |reason: &str| {
        Err(VcsError::InvalidBranchName {
            name: name.to_string(),
            reason: reason.to_string(),
        })
    };

    if name.is_empty() || name.len() > 200 {
        return reject("must be 1-200 characters");
    }
    if name.starts_with('-') || name.starts_with('/') || name.ends_with('/') {
        return reject("must not start with '-' or begin/end with '/'");
    }
    if name.contains("..") {
        return reject("must not contain '..'");
    }
    if name
        .chars()
        .any(|c| c.is_control() || c.is_whitespace() || "~^:?*[\\".contains(c))
    {
        return reject("contains forbidden characters");
    }

    Ok(())
}

/// HTTP implementation of [`VcsClient`].
pub struct HttpVcsClient {
    base_url: String,
    token: Option<String>,
    http_client: Client,
}

#[derive(Debug, Serialize)]
struct BranchRequest<'a> {
    name: &'a str,
    base: &'a str,
}

#[derive(Debug, Serialize)]
struct CommitRequest<'a> {
    branch: &'a str,
    message: &'a str,
    files: &'a [GeneratedFile],
}

#[derive(Debug, Serialize)]
struct PullRequestRequest<'a> {
    branch: &'a str,
    title: &'a str,
    description: &'a str,
    draft: bool,
    labels: &'a [String],
}

#[derive(Debug, Deserialize)]
struct PullRequestResponse {
    number: u64,
    url: String,
}

impl HttpVcsClient {
    /// Creates a client against the given host base URL.
    pub fn new(base_url: String, token: Option<String>) -> Result<Self, VcsError> {
        let http_client = Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .map_err(|e| VcsError::RequestFailed(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url,
            token,
            http_client,
        })
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .http_client
            .post(format!("{}{path}", self.base_url));
        if let Some(ref token) = self.token {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        builder
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, VcsError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let code = status.as_u16();
        let message = response.text().await.unwrap_or_default();
        Err(VcsError::ApiError { code, message })
    }
}

#[async_trait]
impl VcsClient for HttpVcsClient {
    async fn create_branch(&self, repo: &str, name: &str, base: &str) -> Result<(), VcsError> {
        validate_branch_name(name)?;

        let response = self
            .post(&format!("/repos/{repo}/branches"))
            .json(&BranchRequest { name, base })
            .send()
            .await
            .map_err(|e| VcsError::RequestFailed(e.to_string()))?;

        // 409: branch already exists. Re-entry after a crash lands here
        // and must succeed.
        if response.status().as_u16() == 409 {
            tracing::debug!(branch = name, "branch already exists, continuing");
            return Ok(());
        }

        Self::check(response).await.map(|_| ())
    }

    async fn commit_files(
        &self,
        repo: &str,
        branch: &str,
        files: &[GeneratedFile],
        message: &str,
    ) -> Result<(), VcsError> {
        let response = self
            .post(&format!("/repos/{repo}/commits"))
            .json(&CommitRequest {
                branch,
                message,
                files,
            })
            .send()
            .await
            .map_err(|e| VcsError::RequestFailed(e.to_string()))?;

        Self::check(response).await.map(|_| ())
    }

    async fn create_pull_request(
        &self,
        repo: &str,
        branch: &str,
        title: &str,
        description: &str,
        labels: &[String],
    ) -> Result<PullRequestRef, VcsError> {
        let response = self
            .post(&format!("/repos/{repo}/pulls"))
            .json(&PullRequestRequest {
                branch,
                title,
                description,
                draft: true,
                labels,
            })
            .send()
            .await
            .map_err(|e| VcsError::RequestFailed(e.to_string()))?;

        let parsed: PullRequestResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| VcsError::ParseError(e.to_string()))?;

        Ok(PullRequestRef {
            number: parsed.number,
            url: parsed.url,
            draft: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_branch_names() {
        assert!(validate_branch_name("taskpilot/PROJ-142").is_ok());
        assert!(validate_branch_name("feature/rate-limiting").is_ok());
        assert!(validate_branch_name("fix_123").is_ok());
    }

    #[test]
    fn test_rejects_empty_and_oversized() {
        assert!(validate_branch_name("").is_err());
        assert!(validate_branch_name(&"x".repeat(201)).is_err());
    }

    #[test]
    fn test_rejects_traversal_and_leading_dash() {
        assert!(validate_branch_name("../main").is_err());
        assert!(validate_branch_name("-rf").is_err());
        assert!(validate_branch_name("/absolute").is_err());
        assert!(validate_branch_name("trailing/").is_err());
    }

    #[test]
    fn test_rejects_forbidden_characters() {
        assert!(validate_branch_name("has space").is_err());
        assert!(validate_branch_name("has\ttab").is_err());
        assert!(validate_branch_name("tilde~1").is_err());
        assert!(validate_branch_name("star*").is_err());
        assert!(validate_branch_name("colon:name").is_err());
    }

    #[tokio::test]
    async fn test_invalid_branch_rejected_before_any_request() {
        // Unroutable port: if validation didn't short-circuit, this
        // would fail with RequestFailed instead.
        let client = HttpVcsClient::new("http://localhost:65535".to_string(), None).unwrap();
        let err = client
            .create_branch("acme/api", "../main", "main")
            .await
            .unwrap_err();
        assert!(matches!(err, VcsError::InvalidBranchName { .. }));
    }
}
