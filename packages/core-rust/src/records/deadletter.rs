//! Dead-letter entries: the terminal record of a message that could not be
//! validated or delivered.
//!
//! Entries are manual-replay-only. The agent writes them and never reads
//! them back; each entry carries the complete original payload plus a
//! digest so operator tooling can replay or deduplicate by hand.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a message was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// The payload failed decoding or structural validation. Terminal on
    /// first sight; no delivery was attempted.
    ValidationError,
    /// Delivery was attempted and ended in rejection or retry exhaustion.
    DeliveryFailed,
}

impl DeadLetterReason {
    /// The wire value for this reason.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ValidationError => "validation_error",
            Self::DeliveryFailed => "delivery_failed",
        }
    }
}

/// Everything needed to understand and manually replay one failed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Unique id of this entry.
    pub entry_id: String,
    /// Logical queue the message was popped from.
    pub source_queue: String,
    /// Failure class.
    pub reason: DeadLetterReason,
    /// Human-readable failure detail (validation message or last delivery
    /// error).
    pub detail: String,
    /// HTTP delivery attempts made before giving up. Zero for validation
    /// failures.
    pub attempts: u32,
    /// The original payload, byte-for-byte (lossy UTF-8 if it was not
    /// valid text).
    pub payload: String,
    /// Hex SHA-256 of the original payload bytes, for replay tooling.
    pub payload_sha256: String,
    /// When the terminal failure was recorded.
    pub failed_at: DateTime<Utc>,
}
