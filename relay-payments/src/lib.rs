//! Stripe checkout client.
//!
//! Talks to the Stripe REST API directly: checkout session creation, status
//! lookup, and webhook event normalization.

mod client;
mod error;
mod types;

pub use client::{DEFAULT_API_BASE_URL, StripeClient};
pub use error::{PaymentError, Result};
pub use types::{CheckoutMode, CheckoutRequest, CheckoutSession, CheckoutStatus, WebhookEvent};
