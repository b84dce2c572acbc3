//! Chat completion client for the Emergent LLM gateway.
//!
//! Pure HTTP client speaking the OpenAI-compatible `chat/completions` shape.

mod client;
mod error;
mod openai;
mod types;

pub use client::{DEFAULT_BASE_URL, LlmClient, Provider};
pub use error::{LlmError, Result};
pub use types::{ChatMessage, ChatResponse, Role, Usage};
