//! Generation backend client.
//!
//! The backend is an opaque text-completion service behind an
//! OpenAI-compatible chat endpoint. All pipeline call sites go through
//! the [`GenerationBackend`] trait so the breaker guard and test fakes
//! can wrap it.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::breaker::CircuitBreaker;
use crate::error::LlmError;

/// Token usage reported by the backend for one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A completed generation.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Raw text content of the completion.
    pub content: String,
    /// Token accounting.
    pub usage: TokenUsage,
}

/// Trait for text-generation backends.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Generates a completion for the given prompts.
    async fn generate(&self, system_prompt: &str, user_prompt: &str)
        -> Result<Completion, LlmError>;
}

/// HTTP client for an OpenAI-compatible completion endpoint.
pub struct InferenceClient {
    api_base: String,
    api_key: Option<String>,
    model: String,
    http_client: Client,
}

impl InferenceClient {
    /// Creates a client with explicit configuration.
    pub fn new(api_base: String, api_key: Option<String>, model: String) -> Result<Self, LlmError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(180))
            .build()
            .map_err(|e| LlmError::RequestFailed(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            api_base,
            api_key,
            model,
            http_client,
        })
    }

    /// Creates a client from environment variables.
    ///
    /// - `BACKEND_API_BASE`: endpoint base URL (required)
    /// - `BACKEND_API_KEY`: bearer token (optional)
    /// - `BACKEND_MODEL`: model identifier (defaults to "local-coder")
    pub fn from_env() -> Result<Self, LlmError> {
        let api_base = env::var("BACKEND_API_BASE").map_err(|_| LlmError::MissingApiBase)?;
        let api_key = env::var("BACKEND_API_KEY").ok();
        let model = env::var("BACKEND_MODEL").unwrap_or_else(|_| "local-coder".to_string());

        Self::new(api_base, api_key, model)
    }

    /// The endpoint base URL.
    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    /// The configured model identifier.
    pub fn model(&self) -> &str {
        &self.model
    }
}

#[derive(Debug, Serialize)]
struct ApiMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    messages: Vec<ApiMessage<'a>>,
    temperature: f64,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ApiResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize, Default)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[async_trait]
impl GenerationBackend for InferenceClient {
    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<Completion, LlmError> {
        let request = ApiRequest {
            model: &self.model,
            messages: vec![
                ApiMessage {
                    role: "system",
                    content: system_prompt,
                },
                ApiMessage {
                    role: "user",
                    content: user_prompt,
                },
            ],
            temperature: 0.2,
        };

        let url = format!("{}/chat/completions", self.api_base);
        let mut http_request = self
            .http_client
            .post(&url)
            .header("Content-Type", "application/json");

        if let Some(ref api_key) = self.api_key {
            http_request = http_request.header("Authorization", format!("Bearer {api_key}"));
        }

        let response = http_request
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let code = status.as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());

            if let Ok(parsed) = serde_json::from_str::<ApiErrorResponse>(&body) {
                if code == 429 {
                    return Err(LlmError::RateLimited(parsed.error.message));
                }
                return Err(LlmError::ApiError {
                    code,
                    message: parsed.error.message,
                });
            }

            return Err(LlmError::ApiError {
                code,
                message: body,
            });
        }

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(format!("Failed to parse API response: {e}")))?;

        let content = api_response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::ParseError("No choices in backend response".to_string()))?;

        let usage = api_response.usage.unwrap_or_default();

        Ok(Completion {
            content,
            usage: TokenUsage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            },
        })
    }
}

/// Breaker-guarded backend wrapper.
///
/// When the breaker is open every call fails fast with
/// [`LlmError::CircuitOpen`] and the inner backend is never contacted.
/// Any successful call closes the loop by resetting the counter.
pub struct GuardedBackend {
    inner: Arc<dyn GenerationBackend>,
    breaker: Arc<CircuitBreaker>,
}

impl GuardedBackend {
    /// Wraps a backend with a circuit breaker.
    pub fn new(inner: Arc<dyn GenerationBackend>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }

    /// The shared breaker, for operator inspection and reset.
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

#[async_trait]
impl GenerationBackend for GuardedBackend {
    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<Completion, LlmError> {
        if self.breaker.is_open() {
            let state = self.breaker.snapshot();
            return Err(LlmError::CircuitOpen {
                consecutive_failures: state.consecutive_failures,
                threshold: state.threshold,
            });
        }

        match self.inner.generate(system_prompt, user_prompt).await {
            Ok(completion) => {
                self.breaker.record_success();
                Ok(completion)
            }
            Err(e) => {
                if self.breaker.record_failure() {
                    tracing::warn!(error = %e, "circuit breaker opened for generation backend");
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Backend fake that fails a fixed number of times then succeeds.
    struct FlakyBackend {
        calls: AtomicU32,
        failures_before_success: u32,
    }

    impl FlakyBackend {
        fn new(failures_before_success: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures_before_success,
            }
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GenerationBackend for FlakyBackend {
        async fn generate(&self, _system: &str, _user: &str) -> Result<Completion, LlmError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                Err(LlmError::RequestFailed("backend down".to_string()))
            } else {
                Ok(Completion {
                    content: "{}".to_string(),
                    usage: TokenUsage::default(),
                })
            }
        }
    }

    #[tokio::test]
    async fn test_breaker_opens_after_threshold_and_fails_fast() {
        let inner = Arc::new(FlakyBackend::new(u32::MAX));
        let breaker = Arc::new(CircuitBreaker::new(3));
        let guarded = GuardedBackend::new(inner.clone(), breaker);

        for _ in 0..3 {
            assert!(guarded.generate("s", "u").await.is_err());
        }
        assert_eq!(inner.call_count(), 3);

        // Breaker now open: next call fails fast without touching the
        // backend.
        let err = guarded.generate("s", "u").await.unwrap_err();
        assert!(matches!(err, LlmError::CircuitOpen { .. }));
        assert_eq!(inner.call_count(), 3);
    }

    #[tokio::test]
    async fn test_success_resets_breaker() {
        let inner = Arc::new(FlakyBackend::new(2));
        let breaker = Arc::new(CircuitBreaker::new(3));
        let guarded = GuardedBackend::new(inner, breaker);

        assert!(guarded.generate("s", "u").await.is_err());
        assert!(guarded.generate("s", "u").await.is_err());
        assert!(guarded.generate("s", "u").await.is_ok());

        assert_eq!(guarded.breaker().snapshot().consecutive_failures, 0);
        assert!(!guarded.breaker().is_open());
    }

    #[tokio::test]
    async fn test_operator_reset_reopens_traffic() {
        let inner = Arc::new(FlakyBackend::new(1));
        let breaker = Arc::new(CircuitBreaker::new(1));
        let guarded = GuardedBackend::new(inner.clone(), breaker);

        assert!(guarded.generate("s", "u").await.is_err());
        assert!(guarded.breaker().is_open());

        guarded.breaker().reset();
        assert!(guarded.generate("s", "u").await.is_ok());
        assert_eq!(inner.call_count(), 2);
    }

    #[tokio::test]
    async fn test_inference_client_connection_error() {
        let client = InferenceClient::new(
            "http://localhost:65535".to_string(),
            None,
            "test-model".to_string(),
        )
        .unwrap();

        let err = client.generate("system", "user").await.unwrap_err();
        assert!(matches!(err, LlmError::RequestFailed(_)));
    }

    #[test]
    fn test_from_env_requires_api_base() {
        // Only assert the failure path; setting env vars would race with
        // parallel tests.
        if env::var("BACKEND_API_BASE").is_err() {
            assert!(matches!(
                InferenceClient::from_env(),
                Err(LlmError::MissingApiBase)
            ));
        }
    }
}
