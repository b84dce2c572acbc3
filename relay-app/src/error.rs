use relay_llm::LlmError;
use relay_payments::PaymentError;
use thiserror::Error;

/// Every failure an adapter reports. The message is what callers see in the
/// `error` field; the variant is reported as `error_kind`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    MissingCredential(String),

    #[error("{0}")]
    DownstreamFailure(String),

    #[error("{0}")]
    ParseFailure(String),
}

impl AdapterError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::MissingCredential(_) => "missing_credential",
            Self::DownstreamFailure(_) => "downstream_failure",
            Self::ParseFailure(_) => "parse_failure",
        }
    }

    /// Prefixes the message, keeping the kind.
    pub fn context(self, prefix: &str) -> Self {
        match self {
            Self::InvalidInput(m) => Self::InvalidInput(format!("{prefix}{m}")),
            Self::MissingCredential(m) => Self::MissingCredential(format!("{prefix}{m}")),
            Self::DownstreamFailure(m) => Self::DownstreamFailure(format!("{prefix}{m}")),
            Self::ParseFailure(m) => Self::ParseFailure(format!("{prefix}{m}")),
        }
    }
}

impl From<LlmError> for AdapterError {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::InvalidInput(_) => Self::InvalidInput(e.to_string()),
            LlmError::Http(_) | LlmError::ResponseFormat(_) => {
                Self::DownstreamFailure(e.to_string())
            }
        }
    }
}

impl From<PaymentError> for AdapterError {
    fn from(e: PaymentError) -> Self {
        match e {
            PaymentError::InvalidInput(_) => Self::InvalidInput(e.to_string()),
            PaymentError::Http(_) | PaymentError::Api { .. } | PaymentError::ResponseFormat(_) => {
                Self::DownstreamFailure(e.to_string())
            }
        }
    }
}
