//! Field-level validation rules shared by all inbound record types.
//!
//! Validation failures are terminal: a record that fails any rule is
//! dead-lettered by the consumer, never retried. The rules here are
//! deliberately structural (empty ids, out-of-range amounts) -- semantic
//! checks such as duplicate detection belong to the control plane.

use thiserror::Error;

/// A structural validation failure on a single field.
///
/// Carried inside [`crate::codec::CodecError::Invalid`] so consumers can
/// distinguish "unparseable JSON" from "parsed but violates a rule". Both
/// classes are dead-lettered with `reason=validation_error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required string field is empty or whitespace-only.
    #[error("field `{field}` must not be empty")]
    EmptyField {
        /// Name of the offending field.
        field: &'static str,
    },

    /// A numeric field that must be `>= 0` carried a negative value.
    #[error("field `{field}` must be non-negative, got {value}")]
    NegativeValue {
        /// Name of the offending field.
        field: &'static str,
        /// The rejected value.
        value: i64,
    },

    /// A numeric field that must be `> 0` carried a zero or negative value.
    #[error("field `{field}` must be positive, got {value}")]
    NonPositiveValue {
        /// Name of the offending field.
        field: &'static str,
        /// The rejected value.
        value: i64,
    },
}

/// Checks that a required string field is non-empty after trimming.
///
/// # Errors
///
/// Returns [`ValidationError::EmptyField`] if the value is empty or
/// whitespace-only.
pub fn require_non_empty(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::EmptyField { field });
    }
    Ok(())
}

/// Checks that a numeric field is `>= 0`.
///
/// # Errors
///
/// Returns [`ValidationError::NegativeValue`] if the value is negative.
pub fn require_non_negative(field: &'static str, value: i64) -> Result<(), ValidationError> {
    if value < 0 {
        return Err(ValidationError::NegativeValue { field, value });
    }
    Ok(())
}

/// Checks that a numeric field is `> 0`.
///
/// # Errors
///
/// Returns [`ValidationError::NonPositiveValue`] if the value is zero or
/// negative.
pub fn require_positive(field: &'static str, value: i64) -> Result<(), ValidationError> {
    if value <= 0 {
        return Err(ValidationError::NonPositiveValue { field, value });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_empty_accepts_regular_strings() {
        assert!(require_non_empty("transaction_id", "t1").is_ok());
    }

    #[test]
    fn non_empty_rejects_empty_and_whitespace() {
        assert_eq!(
            require_non_empty("transaction_id", ""),
            Err(ValidationError::EmptyField {
                field: "transaction_id"
            })
        );
        assert_eq!(
            require_non_empty("user_id", "   "),
            Err(ValidationError::EmptyField { field: "user_id" })
        );
    }

    #[test]
    fn non_negative_boundary() {
        assert!(require_non_negative("usage_amount", 0).is_ok());
        assert!(require_non_negative("usage_amount", 100).is_ok());
        assert_eq!(
            require_non_negative("usage_amount", -10),
            Err(ValidationError::NegativeValue {
                field: "usage_amount",
                value: -10
            })
        );
    }

    #[test]
    fn positive_boundary() {
        assert!(require_positive("requested_amount", 1).is_ok());
        assert_eq!(
            require_positive("requested_amount", 0),
            Err(ValidationError::NonPositiveValue {
                field: "requested_amount",
                value: 0
            })
        );
    }

    #[test]
    fn error_messages_name_the_field() {
        let err = ValidationError::NegativeValue {
            field: "usage_amount",
            value: -10,
        };
        assert_eq!(
            err.to_string(),
            "field `usage_amount` must be non-negative, got -10"
        );
    }
}
