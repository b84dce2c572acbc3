//! Relay adapters: chat turns to the LLM gateway, checkout sessions to Stripe.
//!
//! Each binary handles one request per process and prints one JSON line.

pub mod chat;
pub mod config;
pub mod doctor;
pub mod error;
pub mod output;
pub mod payments;
pub mod telemetry;

pub use config::RelayConfig;
pub use error::AdapterError;
pub use output::Exit;
