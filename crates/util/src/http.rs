//! # HTTP Utilities
//!
//! Status-code classification for the retry/poll loops and helpers for
//! turning response bodies into readable diagnostics.

use corral_types::FailureKind;
use reqwest::StatusCode;

/// Decide how a response status should be treated by a retrying caller.
///
/// Returns `None` for 2xx. Server errors are transient, 404 is
/// [`FailureKind::NotFound`], every other client error is fatal.
///
/// # Example
/// ```rust
/// use corral_types::FailureKind;
/// use corral_util::http::classify_status;
/// use reqwest::StatusCode;
///
/// assert_eq!(classify_status(StatusCode::OK), None);
/// assert_eq!(classify_status(StatusCode::BAD_GATEWAY), Some(FailureKind::Transient));
/// assert_eq!(classify_status(StatusCode::FORBIDDEN), Some(FailureKind::Fatal));
/// ```
pub fn classify_status(status: StatusCode) -> Option<FailureKind> {
    if status.is_success() {
        return None;
    }
    if status.is_server_error() {
        return Some(FailureKind::Transient);
    }
    match status {
        StatusCode::NOT_FOUND => Some(FailureKind::NotFound),
        _ => Some(FailureKind::Fatal),
    }
}

/// Transport-level failures (refused, reset, timed out) are all worth retrying
/// except a request that could not even be built.
pub fn classify_transport(error: &reqwest::Error) -> FailureKind {
    if error.is_builder() {
        FailureKind::Fatal
    } else {
        FailureKind::Transient
    }
}

/// Return a hint for common HTTP status codes.
///
/// ```rust
/// use corral_util::http::status_error_message;
///
/// assert!(status_error_message(401).unwrap().contains("RANCHER_ACCESS_KEY"));
/// assert!(status_error_message(404).is_none());
/// ```
pub fn status_error_message(status_code: u16) -> Option<String> {
    match status_code {
        401 => Some("Unauthorized (401). Hint: set RANCHER_ACCESS_KEY and RANCHER_SECRET_KEY".into()),
        403 => Some("Forbidden (403). Hint: the API key lacks access to this environment".into()),
        _ => None,
    }
}

/// Collapse whitespace and truncate a response body for error messages.
pub fn truncate_response_preview(text: &str, limit: usize) -> String {
    if text.trim().is_empty() {
        return "<empty>".to_string();
    }

    let mut preview = String::new();
    for ch in text.chars() {
        if preview.len() >= limit {
            preview.push_str("...");
            break;
        }
        match ch {
            '\n' | '\r' | '\t' => {
                if !preview.ends_with(' ') {
                    preview.push(' ');
                }
            }
            _ => preview.push(ch),
        }
    }

    preview.trim().to_string()
}
