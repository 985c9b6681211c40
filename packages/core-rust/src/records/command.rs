//! Remote commands issued by the control plane and their results.
//!
//! The command transport is at-least-once: the same `command_id` can arrive
//! more than once, so execution is idempotent-by-contract -- the processor
//! keeps a bounded recently-seen cache and re-reports the cached result for
//! duplicates instead of re-running the handler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::validate::{require_non_empty, ValidationError};

/// The closed set of operations the control plane may order.
///
/// Dispatch is an exhaustive match; an unknown type on the wire fails
/// deserialization and is reported back as a failed result rather than
/// executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    /// Probe broker and control-plane connectivity.
    HealthCheck,
    /// Report the agent's counters, gauges, and queue depths.
    ReportStatus,
    /// Re-fetch the control plane's public signing keys.
    RefreshKeys,
    /// Drop all pending entries from one named logical queue.
    FlushQueue,
}

impl CommandType {
    /// The wire value for this command type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HealthCheck => "health_check",
            Self::ReportStatus => "report_status",
            Self::RefreshKeys => "refresh_keys",
            Self::FlushQueue => "flush_queue",
        }
    }
}

/// A single command fetched from the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteCommand {
    /// Idempotency key; duplicates are re-acked from the result cache.
    pub command_id: String,
    /// Which operation to run.
    pub command_type: CommandType,
    /// Operation arguments (for example `{"queue": "usage"}` for
    /// `flush_queue`). Absent means no arguments.
    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
    /// When the control plane issued the command.
    pub issued_at: DateTime<Utc>,
}

impl RemoteCommand {
    /// Checks the structural rules.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::EmptyField`] if `command_id` is empty.
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty("command_id", &self.command_id)
    }
}

/// Outcome of one command execution, reported back to the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    /// The command this result answers.
    pub command_id: String,
    /// Whether the handler completed without error.
    pub success: bool,
    /// Handler output on success.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<serde_json::Value>,
    /// Failure description on error.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    /// When the handler ran.
    pub executed_at: DateTime<Utc>,
}

impl CommandResult {
    /// A successful result carrying the handler's output.
    #[must_use]
    pub fn succeeded(command_id: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            command_id: command_id.into(),
            success: true,
            result: Some(result),
            error: None,
            executed_at: Utc::now(),
        }
    }

    /// A failed result carrying the error description.
    #[must_use]
    pub fn failed(command_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            success: false,
            result: None,
            error: Some(error.into()),
            executed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_type_wire_values_are_snake_case() {
        assert_eq!(
            serde_json::to_string(&CommandType::RefreshKeys).unwrap(),
            "\"refresh_keys\""
        );
        let parsed: CommandType = serde_json::from_str("\"flush_queue\"").unwrap();
        assert_eq!(parsed, CommandType::FlushQueue);
    }

    #[test]
    fn payload_defaults_to_empty_map() {
        let json = r#"{
            "command_id": "c1",
            "command_type": "health_check",
            "issued_at": "2024-01-01T00:00:00Z"
        }"#;
        let command: RemoteCommand = serde_json::from_str(json).unwrap();
        assert!(command.payload.is_empty());
        assert!(command.validate().is_ok());
    }

    #[test]
    fn unknown_command_type_fails_to_parse() {
        let json = r#"{
            "command_id": "c2",
            "command_type": "rm_rf_slash",
            "issued_at": "2024-01-01T00:00:00Z"
        }"#;
        let result: Result<RemoteCommand, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn failed_result_skips_result_field() {
        let result = CommandResult::failed("c1", "queue not found");
        let json = serde_json::to_value(&result).unwrap();
        let obj = json.as_object().unwrap();
        assert!(!obj.contains_key("result"));
        assert_eq!(obj["error"], "queue not found");
        assert_eq!(obj["success"], false);
    }

    #[test]
    fn succeeded_result_skips_error_field() {
        let result = CommandResult::succeeded("c1", json!({"dropped": 3}));
        let json = serde_json::to_value(&result).unwrap();
        let obj = json.as_object().unwrap();
        assert!(!obj.contains_key("error"));
        assert_eq!(obj["result"]["dropped"], 3);
    }
}
