//! Usage records produced by upstream audio-processing servers.
//!
//! A [`UsageRecord`] arrives on the usage queue as JSON. After validation the
//! agent wraps it in an [`EnrichedUsageRecord`] carrying server identity and
//! a processing timestamp; enrichment flattens the original record so no
//! field is lost or renamed on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::validate::{require_non_empty, require_non_negative, ValidationError};

/// Billable product that generated a usage record.
///
/// Closed set; the wire values are the short product codes the billing
/// system keys on. Unknown codes fail deserialization and the record is
/// dead-lettered as malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProductCode {
    /// Batch speech-to-text transcription.
    #[serde(rename = "STT")]
    SpeechToText,
    /// Streaming speech-to-text transcription.
    #[serde(rename = "STT_STREAMING")]
    SpeechToTextStreaming,
    /// Text-to-speech synthesis.
    #[serde(rename = "TTS")]
    TextToSpeech,
}

impl ProductCode {
    /// The wire value for this product code.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SpeechToText => "STT",
            Self::SpeechToTextStreaming => "STT_STREAMING",
            Self::TextToSpeech => "TTS",
        }
    }
}

/// A single unit of billable usage reported by an upstream server.
///
/// Immutable once constructed; [`UsageRecord::validate`] is applied at the
/// codec boundary, so every instance the rest of the pipeline sees has
/// already passed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Idempotency key, unique per usage event. The control plane treats a
    /// repeated `transaction_id` as a duplicate and ignores it.
    pub transaction_id: String,
    /// Account the usage is billed to.
    pub user_id: String,
    /// Product that generated the usage.
    pub product_code: ProductCode,
    /// Usage quantity in product-defined units. Signed on the wire so a
    /// negative amount is a validation failure rather than a parse error.
    pub usage_amount: i64,
    /// When the usage occurred on the upstream server.
    pub timestamp: DateTime<Utc>,
}

impl UsageRecord {
    /// Checks the structural rules: non-empty ids, non-negative amount.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationError`] encountered.
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty("transaction_id", &self.transaction_id)?;
        require_non_empty("user_id", &self.user_id)?;
        require_non_negative("usage_amount", self.usage_amount)?;
        Ok(())
    }
}

/// A validated [`UsageRecord`] plus the relay metadata the control plane
/// needs to attribute it.
///
/// Created exactly once per successfully validated record, never mutated.
/// The original record is flattened into the JSON object, so the enriched
/// form is a strict superset of the original fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedUsageRecord {
    /// The original, validated record.
    #[serde(flatten)]
    pub record: UsageRecord,
    /// Identity of the server this agent relays for.
    pub server_id: String,
    /// Deployment region of that server.
    pub server_region: String,
    /// When the agent processed the record.
    pub processed_at: DateTime<Utc>,
    /// Agent build that performed the enrichment.
    pub agent_version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> UsageRecord {
        UsageRecord {
            transaction_id: "t1".to_string(),
            user_id: "u1".to_string(),
            product_code: ProductCode::SpeechToText,
            usage_amount: 100,
            timestamp: "2024-01-01T00:00:00Z".parse().expect("valid timestamp"),
        }
    }

    #[test]
    fn valid_record_passes() {
        assert!(sample_record().validate().is_ok());
    }

    #[test]
    fn negative_usage_amount_fails_validation() {
        let mut record = sample_record();
        record.usage_amount = -10;
        assert_eq!(
            record.validate(),
            Err(ValidationError::NegativeValue {
                field: "usage_amount",
                value: -10
            })
        );
    }

    #[test]
    fn zero_usage_amount_is_allowed() {
        let mut record = sample_record();
        record.usage_amount = 0;
        assert!(record.validate().is_ok());
    }

    #[test]
    fn empty_transaction_id_fails_validation() {
        let mut record = sample_record();
        record.transaction_id = String::new();
        assert_eq!(
            record.validate(),
            Err(ValidationError::EmptyField {
                field: "transaction_id"
            })
        );
    }

    #[test]
    fn product_code_uses_short_wire_values() {
        let json = serde_json::to_string(&ProductCode::SpeechToText).unwrap();
        assert_eq!(json, "\"STT\"");

        let code: ProductCode = serde_json::from_str("\"TTS\"").unwrap();
        assert_eq!(code, ProductCode::TextToSpeech);
    }

    #[test]
    fn unknown_product_code_is_rejected() {
        let result: Result<ProductCode, _> = serde_json::from_str("\"OCR\"");
        assert!(result.is_err());
    }

    #[test]
    fn enrichment_flattens_original_fields() {
        let enriched = EnrichedUsageRecord {
            record: sample_record(),
            server_id: "dp-1".to_string(),
            server_region: "us-east-1".to_string(),
            processed_at: Utc::now(),
            agent_version: "0.1.0".to_string(),
        };

        let json = serde_json::to_value(&enriched).unwrap();
        let obj = json.as_object().expect("object");

        // Original fields stay at the top level alongside the relay metadata.
        assert_eq!(obj["transaction_id"], "t1");
        assert_eq!(obj["user_id"], "u1");
        assert_eq!(obj["product_code"], "STT");
        assert_eq!(obj["usage_amount"], 100);
        assert_eq!(obj["server_id"], "dp-1");
        assert_eq!(obj["server_region"], "us-east-1");
        assert!(obj.contains_key("timestamp"));
        assert!(obj.contains_key("processed_at"));
    }

    #[test]
    fn rfc3339_timestamp_parses() {
        let record = sample_record();
        assert_eq!(record.timestamp.to_rfc3339(), "2024-01-01T00:00:00+00:00");
    }
}
