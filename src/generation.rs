//! # Generation Service Interface
//!
//! The text-generation client is an external collaborator behind the
//! [`Generator`] trait. [`ProtectedGenerator`] is the wrapper every executor
//! actually holds: it validates the request, waits on the token bucket,
//! bounds the call with the per-call timeout, and routes it through the
//! circuit breaker.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::Duration;
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::resilience::{CircuitBreaker, CircuitBreakerError, TokenBucket};

/// Chat roles understood by the generation service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// One generation call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
}

impl GenerationRequest {
    /// Request with a single user turn and provider defaults elsewhere.
    pub fn single_user_turn(content: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::user(content)],
            model: None,
            temperature: None,
            max_output_tokens: None,
            top_p: None,
            top_k: None,
            stop_sequences: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Generation output: the text plus the provider's raw response for
/// diagnostics
#[derive(Debug, Clone)]
pub struct GenerationResponse {
    pub text: String,
    pub raw: serde_json::Value,
}

/// Capability contract for the external text-generation service
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse>;
}

/// Generator wrapper applying rate limiting, per-call timeout, and circuit
/// breaker protection around any inner implementation.
pub struct ProtectedGenerator {
    inner: Arc<dyn Generator>,
    limiter: Arc<TokenBucket>,
    breaker: Arc<CircuitBreaker>,
    call_timeout: Duration,
}

impl ProtectedGenerator {
    pub fn new(
        inner: Arc<dyn Generator>,
        limiter: Arc<TokenBucket>,
        breaker: Arc<CircuitBreaker>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            inner,
            limiter,
            breaker,
            call_timeout,
        }
    }
}

#[async_trait]
impl Generator for ProtectedGenerator {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse> {
        if request.messages.is_empty() {
            return Err(PipelineError::Upstream {
                message: "no messages supplied".to_string(),
                status: None,
                retryable: false,
                retry_after_secs: None,
            });
        }

        self.limiter.acquire().await;
        debug!(messages = request.messages.len(), "dispatching generation call");

        let inner = Arc::clone(&self.inner);
        let timeout = self.call_timeout;
        let result = self
            .breaker
            .call(move || async move {
                match tokio::time::timeout(timeout, inner.generate(request)).await {
                    Ok(result) => result,
                    Err(_) => Err(PipelineError::Upstream {
                        message: format!("generation call timed out after {}s", timeout.as_secs()),
                        status: None,
                        retryable: true,
                        retry_after_secs: None,
                    }),
                }
            })
            .await;

        let response = match result {
            Ok(response) => response,
            Err(CircuitBreakerError::CircuitOpen { component }) => {
                return Err(PipelineError::Upstream {
                    message: format!("circuit breaker open for {component}"),
                    status: None,
                    retryable: true,
                    retry_after_secs: None,
                })
            }
            Err(CircuitBreakerError::OperationFailed(inner_err)) => return Err(inner_err),
        };

        if response.text.trim().is_empty() {
            return Err(PipelineError::Upstream {
                message: "provider returned empty output".to_string(),
                status: None,
                retryable: true,
                retry_after_secs: None,
            });
        }
        Ok(response)
    }
}

/// HTTP client for the generation service: POST the request JSON to the
/// configured endpoint, expect `{"text": "..."}` back. Non-success statuses
/// become [`PipelineError::Upstream`] with retryability derived from the
/// status code and any `Retry-After` header.
pub struct HttpGenerator {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpGenerator {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| {
                PipelineError::configuration("generation.endpoint_url", e.to_string())
            })?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        })
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse> {
        let mut call = self.client.post(&self.endpoint).json(&request);
        if let Some(key) = &self.api_key {
            call = call.bearer_auth(key);
        }

        let response = call.send().await.map_err(|e| PipelineError::Upstream {
            message: format!("generation request failed: {e}"),
            status: None,
            retryable: true,
            retry_after_secs: None,
        })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(crate::resilience::parse_retry_after);
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::Upstream {
                message: format!("generation service returned {status}: {body}"),
                status: Some(status.as_u16()),
                retryable: false,
                retry_after_secs,
            });
        }

        let raw: serde_json::Value =
            response.json().await.map_err(|e| PipelineError::Upstream {
                message: format!("generation response was not JSON: {e}"),
                status: Some(status.as_u16()),
                retryable: true,
                retry_after_secs: None,
            })?;
        let text = raw
            .get("text")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(GenerationResponse { text, raw })
    }
}
