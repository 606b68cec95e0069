//! Google Gemini API provider implementation.
//!
//! Implements the `LlmProvider` trait for the native Gemini `generateContent`
//! endpoint. Key differences from OpenAI-compatible APIs:
//! - Auth via the `x-goog-api-key` header; request URLs never carry the key
//! - System instruction is a top-level `system_instruction` field
//! - Answers arrive as `candidates[0].content.parts[*].text`

use crate::config::{LlmConfig, RetryConfig};
use crate::error::LlmError;
use crate::providers::{GenerationRequest, LlmProvider, with_retry};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// The default Google Gemini API base URL.
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Environment variable consulted when the config carries no key.
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

/// Header carrying the API key.
const API_KEY_HEADER: &str = "x-goog-api-key";

/// Fallback wait when a 429 carries no `Retry-After` header.
const DEFAULT_RETRY_AFTER_SECS: u64 = 30;

/// Google Gemini API provider.
pub struct GeminiProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_output_tokens: Option<u32>,
    temperature: Option<f32>,
    timeout_secs: u64,
    retry: RetryConfig,
}

impl std::fmt::Debug for GeminiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiProvider")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl GeminiProvider {
    /// Create a new Gemini provider from configuration.
    ///
    /// Uses `config.api_key`, falling back to the `GEMINI_API_KEY` environment
    /// variable. Returns `LlmError::AuthFailed` if neither is set.
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var(API_KEY_ENV).ok())
            .ok_or_else(|| LlmError::AuthFailed {
                provider: format!("Gemini (env var '{}' not set)", API_KEY_ENV),
            })?;
        Self::new_with_key(config, api_key)
    }

    /// Create a new Gemini provider with an explicitly provided API key.
    pub fn new_with_key(config: &LlmConfig, api_key: String) -> Result<Self, LlmError> {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| LlmError::Connection {
                message: format!("Failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url,
            api_key,
            model: config.model.clone(),
            max_output_tokens: config.max_output_tokens,
            temperature: config.temperature,
            timeout_secs: config.timeout_secs,
            retry: config.retry.clone(),
        })
    }

    /// Build the JSON request body for the Gemini API.
    fn build_request_body(&self, request: &GenerationRequest) -> Value {
        let mut body = serde_json::json!({
            "contents": [{
                "role": "user",
                "parts": [{"text": request.prompt}],
            }],
        });

        if let Some(system) = &request.system_instruction {
            body["system_instruction"] = serde_json::json!({
                "parts": [{"text": system}]
            });
        }

        let mut generation_config = serde_json::Map::new();
        if let Some(max_tokens) = self.max_output_tokens {
            generation_config.insert("maxOutputTokens".into(), max_tokens.into());
        }
        if let Some(temperature) = self.temperature {
            generation_config.insert("temperature".into(), temperature.into());
        }
        if !generation_config.is_empty() {
            body["generationConfig"] = Value::Object(generation_config);
        }

        body
    }

    /// Extract the answer text from a `generateContent` response.
    ///
    /// Text parts of the first candidate are concatenated and trimmed; thought
    /// summaries (`"thought": true`) are skipped.
    fn parse_response(body: &Value) -> Result<String, LlmError> {
        let candidates = match body["candidates"].as_array() {
            Some(c) if !c.is_empty() => c,
            _ => {
                if let Some(reason) = body["promptFeedback"]["blockReason"].as_str() {
                    return Err(LlmError::Blocked {
                        reason: reason.to_string(),
                    });
                }
                return Err(LlmError::ResponseParse {
                    message: "Missing 'candidates' array in response".to_string(),
                });
            }
        };

        let candidate = &candidates[0];
        let parts = match candidate["content"]["parts"].as_array() {
            Some(parts) => parts,
            None => {
                if candidate["finishReason"].as_str() == Some("SAFETY") {
                    return Err(LlmError::Blocked {
                        reason: "SAFETY".to_string(),
                    });
                }
                return Err(LlmError::ResponseParse {
                    message: "Missing 'parts' array in candidate content".to_string(),
                });
            }
        };

        let text: String = parts
            .iter()
            .filter(|p| p["thought"].as_bool() != Some(true))
            .filter_map(|p| p["text"].as_str())
            .collect();

        if let Some(reason) = candidate["finishReason"].as_str()
            && reason != "STOP"
        {
            debug!(finish_reason = reason, "Gemini finished early");
        }

        Ok(text.trim().to_string())
    }

    /// Map an HTTP status code to the appropriate `LlmError`.
    fn map_http_error(
        status: reqwest::StatusCode,
        retry_after: Option<u64>,
        body_text: &str,
    ) -> LlmError {
        match status.as_u16() {
            401 | 403 => LlmError::AuthFailed {
                provider: "Gemini".to_string(),
            },
            429 => LlmError::RateLimited {
                retry_after_secs: retry_after.unwrap_or(DEFAULT_RETRY_AFTER_SECS),
            },
            500..=599 => LlmError::Unavailable {
                status: status.as_u16(),
                message: body_text.to_string(),
            },
            _ => LlmError::ApiRequest {
                message: format!("HTTP {} from Gemini API: {}", status, body_text),
            },
        }
    }

    /// Build the endpoint URL for a Gemini API call.
    fn endpoint_url(&self, method: &str) -> String {
        format!(
            "{}/models/{}:{}",
            self.base_url, self.model, method
        )
    }

    /// One `generateContent` round trip, without retries.
    async fn generate_once(&self, body: &Value) -> Result<String, LlmError> {
        let response = self
            .client
            .post(self.endpoint_url("generateContent"))
            .header(API_KEY_HEADER, &self.api_key)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                let e = e.without_url();
                if e.is_timeout() {
                    LlmError::Timeout {
                        timeout_secs: self.timeout_secs,
                    }
                } else if e.is_connect() {
                    LlmError::Connection {
                        message: format!("Could not reach Gemini API: {}", e),
                    }
                } else {
                    LlmError::ApiRequest {
                        message: format!("Request to Gemini API failed: {}", e),
                    }
                }
            })?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body_text = response.text().await.map_err(|e| LlmError::ResponseParse {
            message: format!("Failed to read response body: {}", e.without_url()),
        })?;

        if !status.is_success() {
            warn!(status = status.as_u16(), "Gemini API returned an error");
            return Err(Self::map_http_error(status, retry_after, &body_text));
        }

        let response_json: Value =
            serde_json::from_str(&body_text).map_err(|e| LlmError::ResponseParse {
                message: format!("Invalid JSON in response: {}", e),
            })?;

        Self::parse_response(&response_json)
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    async fn generate(&self, request: GenerationRequest) -> Result<String, LlmError> {
        let body = self.build_request_body(&request);
        debug!(
            model = self.model.as_str(),
            prompt_chars = request.prompt.len(),
            "Sending Gemini generation request"
        );
        with_retry(&self.retry, || self.generate_once(&body)).await
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
