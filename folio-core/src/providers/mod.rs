//! LLM provider implementations.
//!
//! The RAG service talks to the model through the `LlmProvider` trait. The
//! production implementation is [`GeminiProvider`]; [`MockLlmProvider`]
//! returns canned answers for tests.

pub mod gemini;

use crate::error::LlmError;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use tracing::warn;

pub use crate::config::RetryConfig;
pub use gemini::GeminiProvider;

/// A single-turn generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    /// The full user prompt (context and question already assembled).
    pub prompt: String,
    /// Top-level system instruction.
    pub system_instruction: Option<String>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_instruction: None,
        }
    }

    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }
}

/// Trait for text-generation backends.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Generate a complete answer for the request.
    async fn generate(&self, request: GenerationRequest) -> Result<String, LlmError>;

    /// Return the model name.
    fn model_name(&self) -> &str;
}

/// Why a failed Gemini call is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// 429; the wait is at least what the server asked for.
    RateLimited { retry_after_secs: u64 },
    /// 5xx; the model is overloaded or restarting.
    Overloaded,
    /// The connection could not be made or was dropped.
    Unreachable,
    /// The request used up its whole timeout.
    TimedOut,
}

impl RetryReason {
    /// `None` for errors that will fail the same way again (auth, bad request,
    /// blocked prompt, unparseable answer).
    pub fn of(err: &LlmError) -> Option<Self> {
        match err {
            LlmError::RateLimited { retry_after_secs } => Some(Self::RateLimited {
                retry_after_secs: *retry_after_secs,
            }),
            LlmError::Unavailable { .. } => Some(Self::Overloaded),
            LlmError::Connection { .. } => Some(Self::Unreachable),
            LlmError::Timeout { .. } => Some(Self::TimedOut),
            _ => None,
        }
    }
}

/// Run `operation` until it succeeds, fails permanently, or the retry budget
/// in `config` is spent. Timeouts draw on their own smaller budget.
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, operation: F) -> Result<T, LlmError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let mut retries = 0;
    let mut timeouts = 0;
    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        let Some(reason) = RetryReason::of(&err) else {
            return Err(err);
        };
        if reason == RetryReason::TimedOut {
            timeouts += 1;
        }
        if retries >= config.max_retries || timeouts > config.max_timeout_retries {
            return Err(err);
        }

        let delay = retry_delay(config, reason, retries);
        warn!(
            retry = retries + 1,
            max = config.max_retries,
            reason = ?reason,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Gemini call failed, retrying"
        );
        tokio::time::sleep(delay).await;
        retries += 1;
    }
}

/// Wait before retry number `retry` (zero-based).
fn retry_delay(config: &RetryConfig, reason: RetryReason, retry: u32) -> Duration {
    let backoff = backoff_ms(config, retry);
    let ms = match reason {
        RetryReason::RateLimited { retry_after_secs } => retry_after_secs.saturating_mul(1000).max(backoff),
        RetryReason::Overloaded | RetryReason::Unreachable | RetryReason::TimedOut => backoff,
    };
    Duration::from_millis(ms)
}

/// `initial * multiplier^retry`, capped, plus up to 25% jitter.
fn backoff_ms(config: &RetryConfig, retry: u32) -> u64 {
    let base = config.initial_backoff_ms as f64 * config.backoff_multiplier.powi(retry as i32);
    let capped = base.min(config.max_backoff_ms as f64) as u64;
    if !config.jitter {
        return capped;
    }
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    let fraction = f64::from(nanos % 1000) / 1000.0;
    capped + (capped as f64 * 0.25 * fraction) as u64
}

/// A provider that returns queued answers, recording every request it sees.
#[derive(Debug, Default)]
pub struct MockLlmProvider {
    answers: Mutex<Vec<Result<String, String>>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl MockLlmProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a provider that always answers with `text`.
    pub fn with_response(text: &str) -> Self {
        let provider = Self::new();
        for _ in 0..20 {
            provider.queue_answer(text);
        }
        provider
    }

    /// Create a provider whose next call fails with an API error.
    pub fn failing(message: &str) -> Self {
        let provider = Self::new();
        provider.queue_failure(message);
        provider
    }

    pub fn queue_answer(&self, text: &str) {
        if let Ok(mut answers) = self.answers.lock() {
            answers.push(Ok(text.to_string()));
        }
    }

    pub fn queue_failure(&self, message: &str) {
        if let Ok(mut answers) = self.answers.lock() {
            answers.push(Err(message.to_string()));
        }
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LlmProvider for MockLlmProvider {
    async fn generate(&self, request: GenerationRequest) -> Result<String, LlmError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        let next = self.answers.lock().ok().and_then(|mut answers| {
            if answers.is_empty() {
                None
            } else {
                Some(answers.remove(0))
            }
        });
        match next {
            Some(Ok(text)) => Ok(text),
            Some(Err(message)) => Err(LlmError::ApiRequest { message }),
            None => Ok("Mock answer".to_string()),
        }
    }

    fn model_name(&self) -> &str {
        "mock-model"
    }
}
