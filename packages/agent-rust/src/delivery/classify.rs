//! Maps HTTP results onto the retry classes the delivery machine consumes.

use std::time::Duration;

use http::{header, HeaderMap, StatusCode};

/// How one HTTP attempt went, as seen by the retry machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeClass {
    /// 2xx: the control plane took the payload.
    Success,
    /// Worth retrying after a delay: network error, timeout, 5xx, or 429.
    Transient {
        /// Server-provided delay hint from `Retry-After`, when present.
        retry_after: Option<Duration>,
        /// Human-readable cause, carried into the terminal outcome.
        reason: String,
    },
    /// 401: the bearer token expired; refresh once and retry.
    AuthExpired,
    /// Terminal: the control plane will never accept this payload as-is.
    Rejected { reason: String },
}

/// Classifies a completed HTTP response by status code.
#[must_use]
pub fn classify_response(status: StatusCode, headers: &HeaderMap) -> OutcomeClass {
    if status.is_success() {
        OutcomeClass::Success
    } else if status == StatusCode::UNAUTHORIZED {
        OutcomeClass::AuthExpired
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        OutcomeClass::Transient {
            retry_after: parse_retry_after(headers),
            reason: format!("status {status}"),
        }
    } else if status.is_server_error() {
        OutcomeClass::Transient {
            retry_after: None,
            reason: format!("status {status}"),
        }
    } else {
        OutcomeClass::Rejected {
            reason: format!("unexpected status {status}"),
        }
    }
}

/// Classifies a request that never produced a response. Always transient:
/// timeouts and connection failures are retried on the normal schedule.
#[must_use]
pub fn classify_transport_error(err: &reqwest::Error) -> OutcomeClass {
    let reason = if err.is_timeout() {
        format!("request timed out: {err}")
    } else {
        format!("transport error: {err}")
    };
    OutcomeClass::Transient {
        retry_after: None,
        reason,
    }
}

/// Delta-seconds form only; HTTP-date hints fall back to computed backoff.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(header::RETRY_AFTER)?.to_str().ok()?;
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}
