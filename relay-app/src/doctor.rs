//! `doctor`: print the resolved, non-secret configuration.

use crate::config::RelayConfig;
use crate::error::AdapterError;
use crate::output;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct DoctorReport {
    pub llm: LlmReport,
    pub payments: PaymentsReport,
    pub timeout_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct LlmReport {
    pub provider: &'static str,
    pub model: String,
    pub base_url: String,
    pub forward_history: bool,
    pub key_present: bool,
}

#[derive(Debug, Serialize)]
pub struct PaymentsReport {
    pub base_url: String,
    pub webhook_url: String,
    pub checkout_mode: &'static str,
    pub key_present: bool,
}

pub fn report(cfg: &RelayConfig) -> DoctorReport {
    DoctorReport {
        llm: LlmReport {
            provider: cfg.provider().as_str(),
            model: cfg.llm.model.clone(),
            base_url: cfg.llm.base_url.clone(),
            forward_history: cfg.llm.forward_history,
            key_present: cfg.require_llm_key().is_ok(),
        },
        payments: PaymentsReport {
            base_url: cfg.payments.base_url.clone(),
            webhook_url: cfg.payments.webhook_url.clone(),
            checkout_mode: cfg.checkout_mode().as_str(),
            key_present: cfg.require_stripe_key().is_ok(),
        },
        timeout_seconds: cfg.http.timeout_seconds,
    }
}

pub fn render(cfg: &RelayConfig) -> String {
    let report = report(cfg);
    tracing::info!(
        model = %report.llm.model,
        llm_key_present = report.llm.key_present,
        stripe_key_present = report.payments.key_present,
        webhook_url = %report.payments.webhook_url,
        "config ok"
    );
    output::render::<DoctorReport>(&Ok::<_, AdapterError>(report))
}
