//! Control-plane delivery: outcome classification, retry schedule, and the
//! HTTP client that applies both.

mod classify;
mod client;
mod retry;

pub use classify::{classify_response, classify_transport_error, OutcomeClass};
pub use client::ControlPlaneClient;
pub use retry::{DeliveryAttempt, NextStep, RetryPolicy};

use thiserror::Error;

/// Terminal result of delivering one payload.
///
/// `attempts` is the number of HTTP calls spent, carried so consumers can
/// stamp dead-letter entries and metrics with the true cost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The control plane acknowledged the payload with a 2xx.
    Accepted { attempts: u32 },
    /// The control plane will never accept this payload as-is.
    Rejected { reason: String, attempts: u32 },
    /// No acceptable answer within the retry budget.
    Unreachable { attempts: u32, last_error: String },
}

impl DeliveryOutcome {
    /// HTTP attempts spent reaching this outcome.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Accepted { attempts }
            | Self::Rejected { attempts, .. }
            | Self::Unreachable { attempts, .. } => *attempts,
        }
    }

    /// Stable label for metrics and logs.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Accepted { .. } => "accepted",
            Self::Rejected { .. } => "rejected",
            Self::Unreachable { .. } => "unreachable",
        }
    }

    #[must_use]
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

/// Errors from query-style control-plane calls (command polling, key
/// fetches, health probes) where the caller wants data, not an outcome.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The request never completed.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// Token exchange failed.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// The response body did not parse.
    #[error("malformed response body: {0}")]
    Body(#[from] serde_json::Error),
    /// The request reached a terminal non-success outcome.
    #[error("request failed: {0}")]
    Failed(String),
}
