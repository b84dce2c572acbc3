//! Single-line JSON result envelope written to stdout.

use crate::error::AdapterError;
use serde::Serialize;

#[derive(Serialize)]
struct Success<'a, T: Serialize> {
    success: bool,
    #[serde(flatten)]
    payload: &'a T,
}

#[derive(Serialize)]
struct Failure<'a> {
    success: bool,
    error: String,
    error_kind: &'a str,
}

/// Renders `{success:true, ...payload}` or `{success:false, error, error_kind}`.
pub fn render<T: Serialize>(result: &Result<T, AdapterError>) -> String {
    match result {
        Ok(payload) => serde_json::to_string(&Success {
            success: true,
            payload,
        })
        .unwrap_or_else(|e| {
            tracing::error!(%e, "result serialization failed");
            render_failure(&AdapterError::ParseFailure(format!(
                "result serialization failed: {e}"
            )))
        }),
        Err(err) => render_failure(err),
    }
}

pub fn render_failure(err: &AdapterError) -> String {
    let failure = Failure {
        success: false,
        error: err.to_string(),
        error_kind: err.kind(),
    };
    serde_json::to_string(&failure).unwrap_or_else(|_| {
        r#"{"success":false,"error":"unserializable error","error_kind":"parse_failure"}"#
            .to_string()
    })
}

/// Process outcome: one JSON line and an exit code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exit {
    pub line: String,
    pub code: i32,
}

impl Exit {
    pub fn ok(line: String) -> Self {
        Self { line, code: 0 }
    }

    pub fn failed(err: &AdapterError, code: i32) -> Self {
        Self {
            line: render_failure(err),
            code,
        }
    }
}
