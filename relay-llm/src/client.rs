use crate::error::{LlmError, Result};
use crate::openai::OpenAiClient;
use crate::types::{ChatMessage, ChatResponse};
use std::time::Duration;

/// Emergent LLM gateway, OpenAI-compatible.
pub const DEFAULT_BASE_URL: &str = "https://integrations.emergentagent.com/llm";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    Anthropic,
    Gemini,
}

impl Provider {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "anthropic" => Ok(Self::Anthropic),
            "gemini" => Ok(Self::Gemini),
            other => Err(LlmError::InvalidInput(format!(
                "unsupported provider {other:?}; expected one of: openai, anthropic, gemini"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAI => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
        }
    }

    /// Model name as the gateway expects it. OpenAI models go bare, the rest
    /// are routed by a `provider/` prefix.
    pub fn wire_model(self, model: &str) -> String {
        let model = model.trim();
        match self {
            Self::OpenAI => model.to_string(),
            other => {
                let prefix = format!("{}/", other.as_str());
                if model.starts_with(&prefix) {
                    model.to_string()
                } else {
                    format!("{prefix}{model}")
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct LlmClient {
    provider: Provider,
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl LlmClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(api_key: &str, provider: Provider, model: &str) -> Self {
        Self {
            provider,
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            client: build_http_client(DEFAULT_TIMEOUT),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim().trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = build_http_client(timeout);
        self
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Sends one completion request. `session_id` is passed through as the
    /// end-user identifier so the gateway can group calls.
    #[tracing::instrument(level = "info", skip_all, fields(provider = self.provider.as_str(), model = %self.model))]
    pub async fn chat(&self, messages: &[ChatMessage], session_id: &str) -> Result<ChatResponse> {
        if self.api_key.trim().is_empty() {
            return Err(LlmError::InvalidInput("api key is empty".to_string()));
        }
        if messages.is_empty() {
            return Err(LlmError::InvalidInput("no messages to send".to_string()));
        }
        let wire_model = self.provider.wire_model(&self.model);
        let c = OpenAiClient::new(self.client.clone(), &self.base_url, &self.api_key, &wire_model);
        c.chat(messages, Some(session_id)).await
    }
}

fn build_http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!(%e, "reqwest client build failed; falling back to default client");
            reqwest::Client::new()
        })
}
