// Reverie Engine — HTTP LLM Client
// One implementation of the LlmClient capability covering four provider
// shapes: a locally-hosted chat endpoint, an OpenAI-compatible endpoint,
// the OpenRouter proxy, and an Anthropic-style messages endpoint.
//
// Retry policy: up to 6 attempts per call, exponential backoff with
// decorrelated jitter capped at 45 s. Rate limits, 5xx, overload markers,
// timeouts, and connection resets are retryable; everything else is
// terminal. Cancellation aborts in-flight requests and backoff sleeps.

use crate::atoms::constants::{MAX_LLM_ATTEMPTS, MAX_RETRY_DELAY_SECS};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::ChatMessage;
use crate::engine::llm::json::extract_json_object;
use crate::engine::llm::{CallOptions, JsonCompletion, LlmClient, LlmConfig, Provider, RetryEvent};
use async_trait::async_trait;
use log::{info, warn};
use rand::Rng;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

pub struct HttpLlmClient {
    client: Client,
}

impl Default for HttpLlmClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpLlmClient {
    pub fn new() -> Self {
        HttpLlmClient {
            client: Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    // ── Request shaping ────────────────────────────────────────────────────

    fn endpoint(config: &LlmConfig) -> String {
        let base = config.effective_base_url();
        match config.provider {
            Provider::Ollama => format!("{base}/api/chat"),
            Provider::OpenAi | Provider::OpenRouter => {
                if base.ends_with("/v1") {
                    format!("{base}/chat/completions")
                } else {
                    format!("{base}/v1/chat/completions")
                }
            }
            Provider::Anthropic => format!("{base}/v1/messages"),
        }
    }

    fn build_body(config: &LlmConfig, messages: &[ChatMessage], json_mode: bool) -> Value {
        match config.provider {
            Provider::Ollama => {
                let mut body = json!({
                    "model": config.model,
                    "messages": messages,
                    "stream": false,
                    "options": {"temperature": config.temperature},
                });
                if json_mode {
                    body["format"] = json!("json");
                }
                body
            }
            Provider::OpenAi | Provider::OpenRouter => {
                let mut body = json!({
                    "model": config.model,
                    "temperature": config.temperature,
                    "messages": messages,
                });
                if json_mode {
                    body["response_format"] = json!({"type": "json_object"});
                }
                body
            }
            Provider::Anthropic => {
                // Anthropic takes the system prompt out of band and wraps
                // message content in typed blocks.
                let system_text = messages
                    .iter()
                    .filter(|m| m.role == "system")
                    .map(|m| m.content.as_str())
                    .collect::<Vec<_>>()
                    .join("\n\n");
                let converted: Vec<Value> = messages
                    .iter()
                    .filter(|m| m.role != "system")
                    .map(|m| {
                        let role = if m.role == "assistant" { "assistant" } else { "user" };
                        json!({
                            "role": role,
                            "content": [{"type": "text", "text": m.content}],
                        })
                    })
                    .collect();
                json!({
                    "model": config.model,
                    "max_tokens": config.max_tokens,
                    "temperature": config.temperature,
                    "system": system_text,
                    "messages": converted,
                })
            }
        }
    }

    fn apply_headers(
        &self,
        req: reqwest::RequestBuilder,
        config: &LlmConfig,
    ) -> reqwest::RequestBuilder {
        let mut req = req.header("Content-Type", "application/json");
        let api_key = config.resolve_api_key();
        match config.provider {
            Provider::Ollama => {}
            Provider::OpenAi => {
                if !api_key.is_empty() {
                    req = req.header("Authorization", format!("Bearer {api_key}"));
                }
            }
            Provider::OpenRouter => {
                if !api_key.is_empty() {
                    req = req.header("Authorization", format!("Bearer {api_key}"));
                }
                if !config.site_url.is_empty() {
                    req = req.header("HTTP-Referer", &config.site_url);
                }
                if !config.app_name.is_empty() {
                    req = req.header("X-Title", &config.app_name);
                }
            }
            Provider::Anthropic => {
                req = req
                    .header("x-api-key", api_key)
                    .header("anthropic-version", "2023-06-01");
            }
        }
        req
    }

    // ── Response shaping ───────────────────────────────────────────────────

    fn extract_text(config: &LlmConfig, data: &Value) -> String {
        match config.provider {
            Provider::Ollama => data["message"]["content"]
                .as_str()
                .unwrap_or("")
                .trim()
                .to_string(),
            Provider::OpenAi | Provider::OpenRouter => data["choices"][0]["message"]["content"]
                .as_str()
                .unwrap_or("")
                .trim()
                .to_string(),
            Provider::Anthropic => {
                let blocks = data["content"].as_array().cloned().unwrap_or_default();
                blocks
                    .iter()
                    .filter(|b| b["type"].as_str() == Some("text"))
                    .filter_map(|b| b["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("\n")
                    .trim()
                    .to_string()
            }
        }
    }

    // ── Retry loop ─────────────────────────────────────────────────────────

    async fn post_with_retry(
        &self,
        config: &LlmConfig,
        body: &Value,
        options: &CallOptions,
    ) -> EngineResult<Value> {
        let url = Self::endpoint(config);
        let timeout = Duration::from_secs(config.timeout_secs.max(1));
        let mut last_error = String::new();

        for attempt in 1..=MAX_LLM_ATTEMPTS {
            if options.cancel.is_cancelled() {
                return Err(EngineError::Aborted);
            }
            if attempt > 1 {
                let delay = backoff_delay(attempt - 1);
                if let Some(sink) = &options.on_retry {
                    sink(&RetryEvent {
                        request_tag: options.request_tag.clone(),
                        attempt,
                        max_attempts: MAX_LLM_ATTEMPTS,
                        delay_ms: delay.as_millis() as u64,
                        error: last_error.clone(),
                    });
                }
                warn!(
                    "[llm] Retry {}/{} for {} after {}ms: {}",
                    attempt,
                    MAX_LLM_ATTEMPTS,
                    options.request_tag,
                    delay.as_millis(),
                    truncate(&last_error, 200)
                );
                tokio::select! {
                    _ = options.cancel.cancelled() => return Err(EngineError::Aborted),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let request = self
                .apply_headers(self.client.post(&url), config)
                .timeout(timeout)
                .json(body);

            let outcome = tokio::select! {
                _ = options.cancel.cancelled() => return Err(EngineError::Aborted),
                result = request.send() => result,
            };

            let response = match outcome {
                Ok(r) => r,
                Err(e) => {
                    last_error = format!("HTTP request failed: {e}");
                    if is_retryable_error(&last_error) && attempt < MAX_LLM_ATTEMPTS {
                        continue;
                    }
                    return Err(EngineError::LlmCallFailed {
                        tag: options.request_tag.clone(),
                        attempts: attempt,
                        message: last_error,
                    });
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body_text = response.text().await.unwrap_or_default();
                last_error = format!("API error {}: {}", status.as_u16(), truncate(&body_text, 500));
                if (is_retryable_status(status.as_u16()) || is_retryable_error(&last_error))
                    && attempt < MAX_LLM_ATTEMPTS
                {
                    continue;
                }
                return Err(EngineError::LlmCallFailed {
                    tag: options.request_tag.clone(),
                    attempts: attempt,
                    message: last_error,
                });
            }

            match response.json::<Value>().await {
                Ok(data) => return Ok(data),
                Err(e) => {
                    last_error = format!("invalid JSON response from {url}: {e}");
                    if attempt < MAX_LLM_ATTEMPTS {
                        continue;
                    }
                    return Err(EngineError::LlmCallFailed {
                        tag: options.request_tag.clone(),
                        attempts: attempt,
                        message: last_error,
                    });
                }
            }
        }

        Err(EngineError::LlmCallFailed {
            tag: options.request_tag.clone(),
            attempts: MAX_LLM_ATTEMPTS,
            message: last_error,
        })
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn chat_complete(
        &self,
        config: &LlmConfig,
        messages: &[ChatMessage],
        options: &CallOptions,
    ) -> EngineResult<String> {
        info!(
            "[llm] {} request provider={} model={}",
            options.request_tag,
            config.provider.as_str(),
            config.model
        );
        let body = Self::build_body(config, messages, false);
        let data = self.post_with_retry(config, &body, options).await?;
        Ok(Self::extract_text(config, &data))
    }

    async fn chat_complete_json(
        &self,
        config: &LlmConfig,
        messages: &[ChatMessage],
        options: &CallOptions,
    ) -> EngineResult<JsonCompletion> {
        info!(
            "[llm] {} json request provider={} model={}",
            options.request_tag,
            config.provider.as_str(),
            config.model
        );
        let body = Self::build_body(config, messages, true);
        let data = match self.post_with_retry(config, &body, options).await {
            Ok(data) => data,
            // Some OpenAI-compatible backends reject response_format; try
            // once more without it before giving up.
            Err(e)
                if matches!(config.provider, Provider::OpenAi | Provider::OpenRouter)
                    && !e.is_abort() =>
            {
                warn!(
                    "[llm] {} json-mode request failed ({}), retrying without response_format",
                    options.request_tag, e
                );
                let plain = Self::build_body(config, messages, false);
                self.post_with_retry(config, &plain, options).await?
            }
            Err(e) => return Err(e),
        };
        let raw = Self::extract_text(config, &data);
        Ok(JsonCompletion {
            parsed: extract_json_object(&raw),
            raw,
        })
    }
}

// ── Classification & backoff ───────────────────────────────────────────────

/// Transient HTTP statuses worth retrying.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504 | 529)
}

/// Marker-text classification for errors that surface without a status
/// (transport failures, proxies that stringify upstream errors). Timeouts
/// are retryable under the default taxonomy.
pub fn is_retryable_error(error_text: &str) -> bool {
    let text = error_text.to_lowercase();
    const MARKERS: &[&str] = &[
        "429",
        "502",
        "503",
        "504",
        "too many requests",
        "rate limit",
        "overloaded",
        "temporarily unavailable",
        "service unavailable",
        "timeout",
        "timed out",
        "connection reset",
        "try again later",
    ];
    MARKERS.iter().any(|m| text.contains(m))
}

/// `min(45 s, 2^(attempt-1) + U[0,1) s)` for 1-based completed attempts.
fn backoff_delay(completed_attempts: u32) -> Duration {
    let base = 2f64.powi(completed_attempts.saturating_sub(1) as i32);
    let jitter: f64 = rand::thread_rng().gen::<f64>();
    Duration::from_secs_f64((base + jitter).min(MAX_RETRY_DELAY_SECS))
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
