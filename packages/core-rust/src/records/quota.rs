//! Quota refresh requests and the control plane's responses.
//!
//! An upstream server nearing its quota pushes a [`QuotaRefreshRequest`]
//! onto the quota queue. The agent relays it to the control plane and, on
//! success, pushes the parsed [`QuotaRefreshResponse`] onto a response queue
//! for the upstream server to pick up.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::usage::ProductCode;
use crate::validate::{require_non_empty, require_positive, ValidationError};

/// A request for more quota, scoped as narrowly as the caller can.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaRefreshRequest {
    /// Idempotency key; the control plane grants at most once per id.
    pub transaction_id: String,
    /// Account requesting quota.
    pub user_id: String,
    /// Session the request is scoped to, when one is active.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub session_id: Option<String>,
    /// Product the quota applies to, when scoped.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub product_code: Option<ProductCode>,
    /// Units requested. When absent the control plane applies its default
    /// grant size.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub requested_amount: Option<i64>,
    /// When the upstream server issued the request.
    pub requested_at: DateTime<Utc>,
}

impl QuotaRefreshRequest {
    /// Checks the structural rules: non-empty ids, positive amount when
    /// present.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationError`] encountered.
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty("transaction_id", &self.transaction_id)?;
        require_non_empty("user_id", &self.user_id)?;
        if let Some(session_id) = &self.session_id {
            require_non_empty("session_id", session_id)?;
        }
        if let Some(amount) = self.requested_amount {
            require_positive("requested_amount", amount)?;
        }
        Ok(())
    }
}

/// The control plane's grant in reply to a refresh request.
///
/// Parsed from the delivery response body; a reply that does not parse is a
/// rejected delivery, not a transient one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaRefreshResponse {
    /// Echoes the request's idempotency key.
    pub transaction_id: String,
    /// Account the grant applies to.
    pub user_id: String,
    /// Units granted. Zero is a valid grant meaning "denied".
    pub granted_amount: i64,
    /// When true, the control plane will grant no further refreshes for
    /// this scope and the upstream server should wind the session down.
    #[serde(default)]
    pub final_grant: bool,
    /// When the control plane issued the grant.
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> QuotaRefreshRequest {
        QuotaRefreshRequest {
            transaction_id: "q1".to_string(),
            user_id: "u1".to_string(),
            session_id: Some("s1".to_string()),
            product_code: Some(ProductCode::SpeechToText),
            requested_amount: Some(500),
            requested_at: Utc::now(),
        }
    }

    #[test]
    fn valid_request_passes() {
        assert!(sample_request().validate().is_ok());
    }

    #[test]
    fn scope_fields_are_optional() {
        let json = r#"{
            "transaction_id": "q2",
            "user_id": "u1",
            "requested_at": "2024-01-01T00:00:00Z"
        }"#;
        let request: QuotaRefreshRequest = serde_json::from_str(json).unwrap();
        assert!(request.session_id.is_none());
        assert!(request.requested_amount.is_none());
        assert!(request.validate().is_ok());
    }

    #[test]
    fn zero_requested_amount_fails_validation() {
        let mut request = sample_request();
        request.requested_amount = Some(0);
        assert_eq!(
            request.validate(),
            Err(ValidationError::NonPositiveValue {
                field: "requested_amount",
                value: 0
            })
        );
    }

    #[test]
    fn empty_scoped_session_id_fails_validation() {
        let mut request = sample_request();
        request.session_id = Some(String::new());
        assert_eq!(
            request.validate(),
            Err(ValidationError::EmptyField { field: "session_id" })
        );
    }

    #[test]
    fn response_final_grant_defaults_to_false() {
        let json = r#"{
            "transaction_id": "q1",
            "user_id": "u1",
            "granted_amount": 500,
            "timestamp": "2024-01-01T00:00:10Z"
        }"#;
        let response: QuotaRefreshResponse = serde_json::from_str(json).unwrap();
        assert!(!response.final_grant);
        assert_eq!(response.granted_amount, 500);
    }
}
