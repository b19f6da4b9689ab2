// Reverie Engine — LLM Client Seam
// The generation engine is provider-agnostic: it consumes the `LlmClient`
// capability below and never sees provider quirks (JSON mode flags,
// system-prompt splitting, headers). Those live in the HTTP implementation.

pub mod client;
pub mod json;

pub use client::HttpLlmClient;

use crate::atoms::error::EngineResult;
use crate::atoms::types::ChatMessage;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::atoms::constants::DEFAULT_REQUEST_TIMEOUT_SECS;

// ── Providers ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    /// Locally hosted chat endpoint (`/api/chat`).
    Ollama,
    /// OpenAI-compatible chat-completions endpoint.
    OpenAi,
    /// OpenRouter proxy (OpenAI-compatible, extra attribution headers).
    OpenRouter,
    /// Anthropic-style messages endpoint.
    Anthropic,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Ollama => "ollama",
            Provider::OpenAi => "openai",
            Provider::OpenRouter => "openrouter",
            Provider::Anthropic => "anthropic",
        }
    }

    pub fn parse(raw: &str) -> Option<Provider> {
        match raw.trim() {
            "ollama" => Some(Provider::Ollama),
            "openai" => Some(Provider::OpenAi),
            "openrouter" => Some(Provider::OpenRouter),
            "anthropic" => Some(Provider::Anthropic),
            _ => None,
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            Provider::Ollama => "http://127.0.0.1:11434",
            Provider::OpenAi => "https://api.openai.com",
            Provider::OpenRouter => "https://openrouter.ai/api/v1",
            Provider::Anthropic => "https://api.anthropic.com",
        }
    }

    /// Environment variable consulted when the config carries no API key.
    pub fn env_key(&self) -> Option<&'static str> {
        match self {
            Provider::Ollama => None,
            Provider::OpenAi => Some("OPENAI_API_KEY"),
            Provider::OpenRouter => Some("OPENROUTER_API_KEY"),
            Provider::Anthropic => Some("ANTHROPIC_API_KEY"),
        }
    }
}

// ── Config ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub provider: Provider,
    /// Empty means the provider default.
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    /// OpenRouter attribution headers.
    pub site_url: String,
    pub app_name: String,
    pub temperature: f64,
    pub timeout_secs: u64,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        LlmConfig {
            provider: Provider::Ollama,
            base_url: String::new(),
            model: String::new(),
            api_key: String::new(),
            site_url: "http://localhost".to_string(),
            app_name: "reverie-engine".to_string(),
            temperature: 0.2,
            timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            max_tokens: 4000,
        }
    }
}

impl LlmConfig {
    /// Base URL with trailing slashes trimmed, defaulted per provider.
    pub fn effective_base_url(&self) -> String {
        let trimmed = self.base_url.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            self.provider.default_base_url().to_string()
        } else {
            trimmed.to_string()
        }
    }

    /// API key from config, falling back to the provider's env variable.
    pub fn resolve_api_key(&self) -> String {
        let key = self.api_key.trim();
        if !key.is_empty() {
            return key.to_string();
        }
        self.provider
            .env_key()
            .and_then(|name| std::env::var(name).ok())
            .unwrap_or_default()
    }
}

// ── Call plumbing ──────────────────────────────────────────────────────────

/// Emitted on every retry so operators can see which call is stalling.
#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub request_tag: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub delay_ms: u64,
    pub error: String,
}

pub type RetrySink = Arc<dyn Fn(&RetryEvent) + Send + Sync>;

/// Per-call options threaded through the client.
#[derive(Clone, Default)]
pub struct CallOptions {
    pub cancel: CancellationToken,
    pub request_tag: String,
    pub on_retry: Option<RetrySink>,
}

impl CallOptions {
    pub fn tagged(tag: impl Into<String>) -> Self {
        CallOptions {
            request_tag: tag.into(),
            ..Default::default()
        }
    }
}

/// A JSON-mode completion: the parsed object plus the raw model text.
#[derive(Debug, Clone)]
pub struct JsonCompletion {
    pub parsed: Value,
    pub raw: String,
}

/// The provider capability the engine consumes. Implementations are
/// stateless per call and shared freely across workers.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a chat completion, returning the text response.
    async fn chat_complete(
        &self,
        config: &LlmConfig,
        messages: &[ChatMessage],
        options: &CallOptions,
    ) -> EngineResult<String>;

    /// Send a chat completion and parse the response as a JSON object.
    async fn chat_complete_json(
        &self,
        config: &LlmConfig,
        messages: &[ChatMessage],
        options: &CallOptions,
    ) -> EngineResult<JsonCompletion>;
}
