//! Issue-tracker client.
//!
//! The tracker is a collaborator, specified only at its interface:
//! fetch a work item, update its status (plain strings matched by exact
//! name), post comments, and post structured questions for human
//! decisions.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TrackerError;
use crate::gate::question::Question;

/// A tracked work item, the input to a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Tracker identifier (e.g., "PROJ-142").
    pub id: String,
    /// Owning project identifier.
    pub project_id: String,
    /// Short title.
    pub title: String,
    /// Full description / acceptance criteria.
    pub description: String,
    /// Repository the change targets.
    pub repository: String,
    /// Base branch to build on.
    pub base_branch: String,
    /// Current tracker status string.
    pub status: String,
}

/// Tracker operations the pipeline depends on.
///
/// All side effects must be safe to repeat: the orchestrator guarantees
/// at-least-once, not exactly-once, delivery.
#[async_trait]
pub trait TrackerClient: Send + Sync {
    /// Fetches a work item by id.
    async fn get_work_item(&self, id: &str) -> Result<WorkItem, TrackerError>;

    /// Sets the work item's status to the exact given string.
    async fn update_status(&self, id: &str, status: &str) -> Result<(), TrackerError>;

    /// Posts a plain comment on the work item.
    async fn post_comment(&self, id: &str, text: &str) -> Result<(), TrackerError>;

    /// Posts a structured question and returns its question id.
    async fn post_question(&self, id: &str, question: &Question) -> Result<Uuid, TrackerError>;
}

/// HTTP implementation of [`TrackerClient`].
pub struct HttpTrackerClient {
    base_url: String,
    token: Option<String>,
    http_client: Client,
}

#[derive(Debug, Serialize)]
struct StatusUpdate<'a> {
    status: &'a str,
}

#[derive(Debug, Serialize)]
struct CommentBody<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct QuestionPosted {
    question_id: Uuid,
}

impl HttpTrackerClient {
    /// Creates a client against the given tracker base URL.
    pub fn new(base_url: String, token: Option<String>) -> Result<Self, TrackerError> {
        let http_client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| TrackerError::RequestFailed(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url,
            token,
            http_client,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .http_client
            .request(method, format!("{}{path}", self.base_url));
        if let Some(ref token) = self.token {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        builder
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, TrackerError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let code = status.as_u16();
        let message = response.text().await.unwrap_or_default();
        Err(TrackerError::ApiError { code, message })
    }
}

#[async_trait]
impl TrackerClient for HttpTrackerClient {
    async fn get_work_item(&self, id: &str) -> Result<WorkItem, TrackerError> {
        let response = self
            .request(reqwest::Method::GET, &format!("/work-items/{id}"))
            .send()
            .await
            .map_err(|e| TrackerError::RequestFailed(e.to_string()))?;

        if response.status().as_u16() == 404 {
            return Err(TrackerError::WorkItemNotFound(id.to_string()));
        }

        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| TrackerError::ParseError(e.to_string()))
    }

    async fn update_status(&self, id: &str, status: &str) -> Result<(), TrackerError> {
        let response = self
            .request(reqwest::Method::PUT, &format!("/work-items/{id}/status"))
            .json(&StatusUpdate { status })
            .send()
            .await
            .map_err(|e| TrackerError::RequestFailed(e.to_string()))?;

        Self::check(response).await.map(|_| ())
    }

    async fn post_comment(&self, id: &str, text: &str) -> Result<(), TrackerError> {
        let response = self
            .request(reqwest::Method::POST, &format!("/work-items/{id}/comments"))
            .json(&CommentBody { text })
            .send()
            .await
            .map_err(|e| TrackerError::RequestFailed(e.to_string()))?;

        Self::check(response).await.map(|_| ())
    }

    async fn post_question(&self, id: &str, question: &Question) -> Result<Uuid, TrackerError> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/work-items/{id}/questions"),
            )
            .json(question)
            .send()
            .await
            .map_err(|e| TrackerError::RequestFailed(e.to_string()))?;

        let posted: QuestionPosted = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| TrackerError::ParseError(e.to_string()))?;

        Ok(posted.question_id)
    }
}
