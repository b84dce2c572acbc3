//! Payment adapter: Stripe checkout sessions and webhook events.
//!
//! Argument and configuration problems exit 1 before any request is made.
//! Once an operation runs, its failures are reported in the JSON line and the
//! process exits 0.

use crate::config::{EnvLookup, RelayConfig};
use crate::doctor;
use crate::error::AdapterError;
use crate::output::{self, Exit};
use async_trait::async_trait;
use clap::error::{ContextKind, ContextValue, ErrorKind};
use clap::{Parser, Subcommand};
use relay_payments::{CheckoutRequest, CheckoutSession, CheckoutStatus, StripeClient, WebhookEvent};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const NO_ACTION: &str = "No action specified";
pub const MISSING_PARAMETERS: &str = "Missing parameters";
pub const MISSING_SESSION_ID: &str = "Missing session_id";
pub const MISSING_SIGNATURE: &str = "Missing signature";
pub const INVALID_ACTION: &str = "Invalid action";

const ACTIONS: &[&str] = &["create_session", "get_status", "webhook", "doctor"];

#[derive(Debug, Parser)]
#[command(
    name = "relay-payments",
    version,
    about = "Create and inspect Stripe checkout sessions"
)]
pub struct PaymentsCli {
    /// TOML config file (default: $RELAY_CONFIG).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub action: Option<Action>,
}

#[derive(Debug, Subcommand)]
pub enum Action {
    /// Create a checkout session for one price.
    #[command(name = "create_session")]
    CreateSession {
        price_id: String,
        success_url: String,
        cancel_url: String,
        /// JSON object of string metadata, e.g. '{"userId":"42"}'.
        metadata: String,
        #[arg(hide = true, allow_hyphen_values = true)]
        extra: Vec<String>,
    },
    /// Look up a checkout session.
    #[command(name = "get_status")]
    GetStatus {
        session_id: String,
        #[arg(hide = true, allow_hyphen_values = true)]
        extra: Vec<String>,
    },
    /// Normalize a webhook delivery. The raw request body is read from stdin.
    Webhook {
        /// Value of the Stripe-Signature header.
        signature: String,
        #[arg(hide = true, allow_hyphen_values = true)]
        extra: Vec<String>,
    },
    /// Print the resolved configuration.
    Doctor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Operation(Operation),
    Doctor,
}

/// The calls that need a Stripe key.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Operation {
    CreateSession(CheckoutRequest),
    GetStatus(String),
    Webhook(String),
}

impl TryFrom<Action> for Command {
    type Error = AdapterError;

    fn try_from(action: Action) -> Result<Self, AdapterError> {
        Ok(match action {
            Action::CreateSession {
                price_id,
                success_url,
                cancel_url,
                metadata,
                extra,
            } => {
                ignore_extra("create_session", &extra);
                Command::Operation(Operation::CreateSession(CheckoutRequest {
                    price_id,
                    success_url,
                    cancel_url,
                    metadata: parse_metadata(&metadata)?,
                }))
            }
            Action::GetStatus { session_id, extra } => {
                ignore_extra("get_status", &extra);
                Command::Operation(Operation::GetStatus(session_id))
            }
            Action::Webhook { signature, extra } => {
                ignore_extra("webhook", &extra);
                Command::Operation(Operation::Webhook(signature))
            }
            Action::Doctor => Command::Doctor,
        })
    }
}

#[async_trait]
pub trait CheckoutBackend: Send + Sync {
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, AdapterError>;

    async fn get_checkout_status(&self, session_id: &str)
    -> Result<CheckoutStatus, AdapterError>;

    async fn handle_webhook(
        &self,
        body: &[u8],
        signature: &str,
    ) -> Result<WebhookEvent, AdapterError>;
}

#[async_trait]
impl CheckoutBackend for StripeClient {
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, AdapterError> {
        Ok(StripeClient::create_checkout_session(self, request).await?)
    }

    async fn get_checkout_status(
        &self,
        session_id: &str,
    ) -> Result<CheckoutStatus, AdapterError> {
        Ok(StripeClient::get_checkout_status(self, session_id).await?)
    }

    async fn handle_webhook(
        &self,
        body: &[u8],
        signature: &str,
    ) -> Result<WebhookEvent, AdapterError> {
        Ok(StripeClient::handle_webhook(self, body, signature).await?)
    }
}

pub fn connect_stripe(cfg: &RelayConfig, api_key: &str) -> Box<dyn CheckoutBackend> {
    Box::new(
        StripeClient::new(api_key)
            .with_base_url(&cfg.payments.base_url)
            .with_mode(cfg.checkout_mode())
            .with_timeout(cfg.timeout()),
    )
}

/// Parses the metadata argument. Scalars are stringified, nulls dropped;
/// nested values are rejected since Stripe metadata is flat.
pub fn parse_metadata(raw: &str) -> Result<BTreeMap<String, String>, AdapterError> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| AdapterError::ParseFailure(format!("Invalid metadata JSON: {e}")))?;
    let serde_json::Value::Object(map) = value else {
        return Err(AdapterError::ParseFailure(
            "Invalid metadata JSON: expected an object".to_string(),
        ));
    };

    let mut out = BTreeMap::new();
    for (key, value) in map {
        let value = match value {
            serde_json::Value::Null => continue,
            serde_json::Value::String(s) => s,
            serde_json::Value::Bool(b) => b.to_string(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
                return Err(AdapterError::ParseFailure(format!(
                    "Invalid metadata JSON: value for {key:?} must be a scalar"
                )));
            }
        };
        out.insert(key, value);
    }
    Ok(out)
}

pub async fn create_checkout_session(
    backend: &dyn CheckoutBackend,
    price_id: &str,
    success_url: &str,
    cancel_url: &str,
    metadata: BTreeMap<String, String>,
) -> Result<CheckoutSession, AdapterError> {
    let request = CheckoutRequest {
        price_id: price_id.to_string(),
        success_url: success_url.to_string(),
        cancel_url: cancel_url.to_string(),
        metadata,
    };
    backend.create_checkout_session(&request).await
}

pub async fn get_checkout_status(
    backend: &dyn CheckoutBackend,
    session_id: &str,
) -> Result<CheckoutStatus, AdapterError> {
    backend.get_checkout_status(session_id).await
}

pub async fn handle_webhook(
    backend: &dyn CheckoutBackend,
    body: &[u8],
    signature: &str,
) -> Result<WebhookEvent, AdapterError> {
    backend.handle_webhook(body, signature).await
}

fn ignore_extra(action: &str, extra: &[String]) {
    if !extra.is_empty() {
        tracing::debug!(action, ignored = extra.len(), "ignoring extra arguments");
    }
}

/// First argument naming a known action, wherever global flags put it.
fn requested_action(args: &[OsString]) -> Option<&'static str> {
    args.iter()
        .skip(1)
        .filter_map(|a| a.to_str())
        .find_map(|a| ACTIONS.iter().copied().find(|known| *known == a))
}

fn cli_error(args: &[OsString], e: &clap::Error) -> AdapterError {
    let action = requested_action(args);
    let message = match (e.kind(), action) {
        (ErrorKind::MissingRequiredArgument, Some("get_status")) => MISSING_SESSION_ID.to_string(),
        (ErrorKind::MissingRequiredArgument, Some("webhook")) => MISSING_SIGNATURE.to_string(),
        (ErrorKind::MissingRequiredArgument, _) => MISSING_PARAMETERS.to_string(),
        (ErrorKind::MissingSubcommand | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand, _) => {
            NO_ACTION.to_string()
        }
        (ErrorKind::InvalidSubcommand, _) | (_, None) => INVALID_ACTION.to_string(),
        (_, Some(_)) => match e.get(ContextKind::InvalidArg) {
            Some(ContextValue::String(arg)) => format!("Unexpected argument: {arg}"),
            _ => format!(
                "Invalid arguments: {}",
                e.kind().as_str().unwrap_or("unexpected input")
            ),
        },
    };
    AdapterError::InvalidInput(message)
}

fn log_failure<T>(operation: &str, result: &Result<T, AdapterError>) {
    if let Err(e) = result {
        tracing::warn!(operation, error_kind = e.kind(), error = %e, "payment operation failed");
    }
}

/// Runs one payment invocation.
pub async fn run<I, T, R, F>(args: I, env: EnvLookup<'_>, mut stdin: R, connect: F) -> Exit
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
    R: AsyncRead + Unpin,
    F: FnOnce(&RelayConfig, &str) -> Box<dyn CheckoutBackend>,
{
    let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
    let cli = match PaymentsCli::try_parse_from(args.iter()) {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            return Exit::ok(e.render().to_string());
        }
        Err(e) => return Exit::failed(&cli_error(&args, &e), 1),
    };

    let Some(action) = cli.action else {
        return Exit::failed(&AdapterError::InvalidInput(NO_ACTION.to_string()), 1);
    };
    let command = match Command::try_from(action) {
        Ok(command) => command,
        Err(e) => return Exit::failed(&e, 1),
    };

    let cfg = match RelayConfig::load(cli.config, env).await {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(error = %e, "config load failed");
            let err = AdapterError::InvalidInput(format!("config error: {e:#}"));
            return Exit::failed(&err, 1);
        }
    };

    let operation = match command {
        Command::Doctor => return Exit::ok(doctor::render(&cfg)),
        Command::Operation(operation) => operation,
    };

    let api_key = match cfg.require_stripe_key() {
        Ok(key) => key,
        Err(e) => {
            tracing::warn!(error = %e, "stripe key missing");
            return Exit::failed(&e, 1);
        }
    };
    tracing::debug!(webhook_url = %cfg.payments.webhook_url, "payments configured");
    let backend = connect(&cfg, api_key);

    let line = match operation {
        Operation::CreateSession(request) => {
            let result = create_checkout_session(
                backend.as_ref(),
                &request.price_id,
                &request.success_url,
                &request.cancel_url,
                request.metadata.clone(),
            )
            .await;
            log_failure("create_session", &result);
            output::render(&result)
        }
        Operation::GetStatus(session_id) => {
            let result = get_checkout_status(backend.as_ref(), &session_id).await;
            log_failure("get_status", &result);
            output::render(&result)
        }
        Operation::Webhook(signature) => {
            let mut body = Vec::new();
            let result = match stdin.read_to_end(&mut body).await {
                Ok(_) => handle_webhook(backend.as_ref(), &body, &signature).await,
                Err(e) => Err(AdapterError::InvalidInput(format!("read stdin: {e}"))),
            };
            log_failure("webhook", &result);
            output::render(&result)
        }
    };
    Exit::ok(line)
}
