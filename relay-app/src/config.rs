//! Relay configuration loader.
//!
//! Built once at process start: optional TOML file, then environment
//! overrides, then validation. Adapters receive the resulting struct and never
//! read the environment themselves.

use crate::error::AdapterError;
use relay_llm::Provider;
use relay_payments::CheckoutMode;
use reqwest::Url;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Environment accessor. Production passes `std::env::var`, tests pass a map.
pub type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

pub const LLM_KEY_VAR: &str = "EMERGENT_LLM_KEY";
pub const STRIPE_KEY_VAR: &str = "STRIPE_API_KEY";

pub const DEFAULT_SYSTEM_PROMPT: &str = "Você é YOU, um gêmeo IA empático e inteligente. Responda sempre em português brasileiro de forma natural e acolhedora.";
pub const DEFAULT_WEBHOOK_URL: &str = "https://your-app.emergent.sh/api/payments/webhook/stripe";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub payments: PaymentsConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    /// Persona used when the conversation carries no system message.
    #[serde(default = "default_system_prompt")]
    pub default_system_prompt: String,
    /// Replay earlier user/assistant turns to the backend. Off by default:
    /// each call only sends the system prompt and the last user message.
    #[serde(default)]
    pub forward_history: bool,
}

fn default_llm_base_url() -> String {
    relay_llm::DEFAULT_BASE_URL.to_string()
}

fn default_llm_provider() -> String {
    "openai".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_llm_base_url(),
            provider: default_llm_provider(),
            model: default_llm_model(),
            default_system_prompt: default_system_prompt(),
            forward_history: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentsConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_stripe_base_url")]
    pub base_url: String,
    /// Where Stripe is told to deliver webhooks for this deployment.
    #[serde(default = "default_webhook_url")]
    pub webhook_url: String,
    #[serde(default = "default_checkout_mode")]
    pub checkout_mode: String,
}

fn default_stripe_base_url() -> String {
    relay_payments::DEFAULT_API_BASE_URL.to_string()
}

fn default_webhook_url() -> String {
    DEFAULT_WEBHOOK_URL.to_string()
}

fn default_checkout_mode() -> String {
    "payment".to_string()
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_stripe_base_url(),
            webhook_url: default_webhook_url(),
            checkout_mode: default_checkout_mode(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_timeout_seconds() -> u64 {
    60
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

impl RelayConfig {
    pub async fn load(path: Option<PathBuf>, env: EnvLookup<'_>) -> anyhow::Result<Self> {
        let path = path.or_else(|| non_empty(env("RELAY_CONFIG")).map(PathBuf::from));

        let mut cfg = match path {
            Some(path) => {
                let contents = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;
                let cfg: RelayConfig = toml::from_str(&contents)
                    .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;
                tracing::debug!(config_path = %path.display(), "config file loaded");
                cfg
            }
            None => RelayConfig::default(),
        };

        cfg.apply_env_overrides(env)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reads the process environment.
    pub fn process_env(key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    fn apply_env_overrides(&mut self, env: EnvLookup<'_>) -> anyhow::Result<()> {
        if let Some(v) = non_empty(env(LLM_KEY_VAR)) {
            self.llm.api_key = Some(v);
        }
        if let Some(v) = non_empty(env("EMERGENT_LLM_BASE_URL")) {
            self.llm.base_url = v;
        }
        if let Some(v) = non_empty(env("RELAY_LLM_PROVIDER")) {
            self.llm.provider = v;
        }
        if let Some(v) = non_empty(env("RELAY_CHAT_MODEL")) {
            self.llm.model = v;
        }
        if let Some(v) = non_empty(env("RELAY_FORWARD_HISTORY")) {
            self.llm.forward_history = parse_bool("RELAY_FORWARD_HISTORY", &v)?;
        }
        if let Some(v) = non_empty(env(STRIPE_KEY_VAR)) {
            self.payments.api_key = Some(v);
        }
        if let Some(v) = non_empty(env("STRIPE_API_BASE_URL")) {
            self.payments.base_url = v;
        }
        if let Some(v) = non_empty(env("STRIPE_CHECKOUT_MODE")) {
            self.payments.checkout_mode = v;
        }
        if let Some(v) = non_empty(env("WEBHOOK_URL")) {
            self.payments.webhook_url = v;
        }
        if let Some(v) = non_empty(env("RELAY_HTTP_TIMEOUT_SECONDS")) {
            self.http.timeout_seconds = v.trim().parse().map_err(|e| {
                anyhow::anyhow!("RELAY_HTTP_TIMEOUT_SECONDS must be an integer: {e}")
            })?;
        }
        Ok(())
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.llm.model.trim().is_empty() {
            return Err(anyhow::anyhow!("llm.model is required"));
        }
        Provider::parse(&self.llm.provider).map_err(|e| anyhow::anyhow!("llm.provider: {e}"))?;
        require_http_url("llm.base_url", &self.llm.base_url)?;
        require_http_url("payments.base_url", &self.payments.base_url)?;
        require_http_url("payments.webhook_url", &self.payments.webhook_url)?;
        if CheckoutMode::parse(&self.payments.checkout_mode).is_none() {
            return Err(anyhow::anyhow!(
                "payments.checkout_mode must be one of: payment, subscription; got {:?}",
                self.payments.checkout_mode
            ));
        }
        if self.http.timeout_seconds == 0 {
            return Err(anyhow::anyhow!("http.timeout_seconds must be > 0"));
        }
        Ok(())
    }

    pub fn provider(&self) -> Provider {
        Provider::parse(&self.llm.provider).unwrap_or(Provider::OpenAI)
    }

    pub fn checkout_mode(&self) -> CheckoutMode {
        CheckoutMode::parse(&self.payments.checkout_mode).unwrap_or_default()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.http.timeout_seconds)
    }

    pub fn require_llm_key(&self) -> Result<&str, AdapterError> {
        self.llm
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| AdapterError::MissingCredential(format!("{LLM_KEY_VAR} not found")))
    }

    pub fn require_stripe_key(&self) -> Result<&str, AdapterError> {
        self.payments
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| AdapterError::MissingCredential(format!("{STRIPE_KEY_VAR} not found")))
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_bool(name: &str, raw: &str) -> anyhow::Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow::anyhow!("{name} must be a boolean, got {other:?}")),
    }
}

fn require_http_url(field: &str, value: &str) -> anyhow::Result<()> {
    let normalized = value.trim().trim_end_matches('/');
    if normalized.is_empty() {
        return Err(anyhow::anyhow!("{field} is required"));
    }
    let parsed =
        Url::parse(normalized).map_err(|e| anyhow::anyhow!("invalid {field} {value:?}: {e}"))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(anyhow::anyhow!(
            "invalid {field} scheme: {other} (expected http or https)"
        )),
    }
}
