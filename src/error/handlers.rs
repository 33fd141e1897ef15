//! HTTP status-code-to-error mapping, kept as its own module the way the
//! teacher crate separates response-status interpretation from the error
//! enum itself.

use super::{BuildError, RegistryErrorEntry};
use reqwest::StatusCode;

/// Builds a [`BuildError::RegistryError`] from a non-2xx response body,
/// decoding the OCI distribution spec's `{errors:[{code,message,detail}]}`
/// shape when present and falling back to the raw body otherwise.
pub fn registry_error(operation: &str, status: StatusCode, body: &str) -> BuildError {
    let entries = parse_error_body(body);
    BuildError::RegistryError {
        operation: operation.to_string(),
        status: status.as_u16(),
        entries,
    }
}

fn parse_error_body(body: &str) -> Vec<RegistryErrorEntry> {
    #[derive(serde::Deserialize)]
    struct ErrorsEnvelope {
        errors: Vec<RegistryErrorEntry>,
    }

    serde_json::from_str::<ErrorsEnvelope>(body)
        .map(|e| e.errors)
        .unwrap_or_else(|_| {
            vec![RegistryErrorEntry {
                code: "UNKNOWN".to_string(),
                message: body.to_string(),
                detail: None,
            }]
        })
}

/// Classifies an auth-endpoint failure.
pub fn auth_error(status: StatusCode, body: &str) -> BuildError {
    match status.as_u16() {
        401 | 403 => BuildError::RegistryAuthenticationFailed(format!(
            "credential rejected by token endpoint: {body}"
        )),
        _ => BuildError::RegistryAuthenticationFailed(format!(
            "token endpoint returned {status}: {body}"
        )),
    }
}
