//! Session lifecycle events from upstream audio servers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::validate::{require_non_empty, ValidationError};

/// Kind of session lifecycle transition.
///
/// The agent does not enforce ordering between `start` and `complete` for
/// the same session -- the control plane reconciles ordering on its side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionEventType {
    /// A session was opened.
    Start,
    /// A session ended normally.
    Complete,
    /// A session ended abnormally.
    Error,
}

impl SessionEventType {
    /// The wire value, also used as the event's path segment on the
    /// control-plane session endpoint.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

/// One lifecycle transition for an audio session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionLifecycleEvent {
    /// Session the event belongs to.
    pub session_id: String,
    /// Which transition occurred.
    pub event_type: SessionEventType,
    /// When the transition occurred upstream.
    pub timestamp: DateTime<Utc>,
    /// Free-form event context (disconnect reason, codec, final usage
    /// summary). Passed through to the control plane untouched.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

impl SessionLifecycleEvent {
    /// Checks the structural rules.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::EmptyField`] if `session_id` is empty.
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty("session_id", &self.session_id)
    }
}
