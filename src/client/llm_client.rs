//! LLM client for OpenAI-compatible endpoints.
//!
//! Covers the two transport shapes the pipeline needs: chat completions and
//! embeddings. Transport-level flakiness (timeouts, 429s, transient network
//! errors) is retried here with exponential backoff; everything above this
//! layer deals in domain outcomes, not HTTP.

use crate::client::RateLimiter;
use crate::models::{ApiError, ModelSpec, Result, TekmerionError};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Message in a chat completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Chat completion request payload.
#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    max_tokens: u32,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

/// Chat completion response.
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

/// Embeddings request payload.
#[derive(Debug, Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

/// Embeddings response.
#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

/// API error response (OpenAI-compatible).
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Response from a completion request.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    /// Generated content
    pub content: String,
    /// Model used (may differ from requested)
    pub model: String,
    /// Request duration
    pub duration: Duration,
}

/// Client for any OpenAI-compatible endpoint.
///
/// Features:
/// - Retry with exponential backoff on transient failures
/// - Adaptive rate limit handling from response headers
/// - JSON-object response mode for structured capability calls
pub struct LlmClient {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    timeout: Duration,
    max_retries: u32,
    rate_limiter: Arc<RateLimiter>,
}

impl LlmClient {
    /// Create a new client.
    pub fn new(
        api_key: Option<String>,
        base_url: String,
        timeout_secs: u64,
        max_retries: u32,
    ) -> Result<Self> {
        let timeout = Duration::from_secs(timeout_secs);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(TekmerionError::Network)?;

        Ok(Self {
            client,
            api_key,
            base_url,
            timeout,
            max_retries,
            rate_limiter: Arc::new(RateLimiter::new()),
        })
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(ref api_key) = self.api_key {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {api_key}")) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers
    }

    /// POST a JSON payload with retry/backoff/rate-limit handling.
    ///
    /// Returns the raw successful response; every non-2xx outcome is mapped
    /// to the error taxonomy.
    async fn post_with_retry<B: Serialize>(
        &self,
        url: &str,
        model_id: &str,
        body: &B,
    ) -> Result<reqwest::Response> {
        let mut last_error: Option<TekmerionError> = None;

        for attempt in 0..self.max_retries {
            self.rate_limiter.wait_if_needed(model_id).await;

            let response = self
                .client
                .post(url)
                .headers(self.headers())
                .json(body)
                .send()
                .await;

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    last_error = Some(if e.is_timeout() {
                        TekmerionError::Timeout(self.timeout)
                    } else {
                        TekmerionError::Network(e)
                    });
                    if attempt < self.max_retries - 1 {
                        let backoff = Duration::from_secs(2u64.pow(attempt));
                        debug!(
                            attempt = attempt,
                            backoff_secs = backoff.as_secs(),
                            "Retrying after network error"
                        );
                        tokio::time::sleep(backoff).await;
                    }
                    continue;
                }
            };

            let status = response.status().as_u16();
            let headers = response.headers().clone();
            self.rate_limiter.record_request(model_id, status, &headers);

            if status == 429 {
                let error = TekmerionError::RateLimited {
                    retry_after_secs: headers
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<f64>().ok())
                        .unwrap_or(1.0),
                };
                let wait_secs = error.retry_after().unwrap_or(1.0);
                last_error = Some(error);

                if attempt < self.max_retries - 1 {
                    debug!(
                        attempt = attempt,
                        retry_after_secs = wait_secs,
                        "Rate limited, waiting"
                    );
                    tokio::time::sleep(Duration::from_secs_f64(wait_secs)).await;
                }
                continue;
            }

            if !response.status().is_success() {
                let error_body = response.text().await.unwrap_or_default();
                let error =
                    if let Ok(api_error) = serde_json::from_str::<ApiErrorResponse>(&error_body) {
                        match status {
                            401 => ApiError::AuthenticationFailed,
                            404 => ApiError::ModelNotFound(model_id.to_string()),
                            _ => ApiError::ApiError {
                                status,
                                message: api_error.error.message,
                            },
                        }
                    } else {
                        ApiError::ApiError {
                            status,
                            message: error_body,
                        }
                    };

                let error = TekmerionError::Api(error);
                let retryable = error.is_retryable();
                last_error = Some(error);

                // Auth errors, unknown models and other 4xx won't heal
                if !retryable {
                    break;
                }

                if attempt < self.max_retries - 1 {
                    let backoff = Duration::from_secs(2u64.pow(attempt));
                    tokio::time::sleep(backoff).await;
                }
                continue;
            }

            return Ok(response);
        }

        Err(last_error.unwrap_or_else(|| {
            TekmerionError::Api(ApiError::MaxRetriesExceeded {
                attempts: self.max_retries,
                last_error: "Unknown error".to_string(),
            })
        }))
    }

    /// Complete a chat request.
    pub async fn complete(
        &self,
        model: &ModelSpec,
        messages: Vec<Message>,
        json_mode: bool,
    ) -> Result<CompletionResponse> {
        let start = Instant::now();

        let request = ChatCompletionRequest {
            model: model.id.clone(),
            messages,
            max_tokens: model.max_tokens,
            temperature: model.temperature,
            response_format: json_mode.then(|| serde_json::json!({"type": "json_object"})),
        };

        let url = format!("{}/chat/completions", self.base_url);
        let response = self.post_with_retry(&url, &model.id, &request).await?;

        let body: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| TekmerionError::ParseError(format!("Failed to parse response: {e}")))?;

        let content = body
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| TekmerionError::ParseError("No choices in response".to_string()))?;

        Ok(CompletionResponse {
            content,
            model: body.model.unwrap_or_else(|| model.id.clone()),
            duration: start.elapsed(),
        })
    }

    /// Complete with system and user prompts, expecting a JSON object back.
    pub async fn complete_json(
        &self,
        model: &ModelSpec,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<CompletionResponse> {
        let messages = vec![Message::system(system_prompt), Message::user(user_prompt)];
        self.complete(model, messages, true).await
    }

    /// Embed a batch of texts.
    ///
    /// Returns vectors in the same order and count as the input.
    pub async fn embeddings(&self, model_id: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = EmbeddingsRequest {
            model: model_id,
            input: texts,
        };

        let url = format!("{}/embeddings", self.base_url);
        let response = self.post_with_retry(&url, model_id, &request).await?;

        let body: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| TekmerionError::ParseError(format!("Failed to parse embeddings: {e}")))?;

        if body.data.len() != texts.len() {
            return Err(TekmerionError::Api(ApiError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                body.data.len()
            ))));
        }

        // The endpoint may return data out of order; realign by index.
        let mut data = body.data;
        data.sort_by_key(|d| d.index);
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }
}
