//! Queue payload decoding: raw bytes in, validated records out.
//!
//! Every inbound payload passes through here before the pipeline touches
//! it. Two failure classes, both terminal (dead-lettered, never retried):
//!
//! - [`CodecError::Malformed`] -- the bytes are not valid JSON for the
//!   expected shape (bad syntax, missing field, wrong type, unknown enum
//!   value).
//! - [`CodecError::Invalid`] -- the JSON parsed but a field violates a
//!   structural rule (empty id, negative amount).

use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::records::{QuotaRefreshRequest, RemoteCommand, SessionLifecycleEvent, UsageRecord};
use crate::validate::ValidationError;

/// Why a payload was rejected at the codec boundary.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The payload is not parseable as the expected record shape.
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The payload parsed but violates a validation rule.
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

fn parse<T: DeserializeOwned>(payload: &[u8]) -> Result<T, CodecError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Decodes and validates a usage record payload.
///
/// # Errors
///
/// Returns [`CodecError`] if the payload is malformed or fails validation.
pub fn decode_usage_record(payload: &[u8]) -> Result<UsageRecord, CodecError> {
    let record: UsageRecord = parse(payload)?;
    record.validate()?;
    Ok(record)
}

/// Decodes and validates a session lifecycle event payload.
///
/// # Errors
///
/// Returns [`CodecError`] if the payload is malformed or fails validation.
pub fn decode_session_event(payload: &[u8]) -> Result<SessionLifecycleEvent, CodecError> {
    let event: SessionLifecycleEvent = parse(payload)?;
    event.validate()?;
    Ok(event)
}

/// Decodes and validates a quota refresh request payload.
///
/// # Errors
///
/// Returns [`CodecError`] if the payload is malformed or fails validation.
pub fn decode_quota_request(payload: &[u8]) -> Result<QuotaRefreshRequest, CodecError> {
    let request: QuotaRefreshRequest = parse(payload)?;
    request.validate()?;
    Ok(request)
}

/// Decodes and validates one remote command from a control-plane response
/// element.
///
/// Takes a [`serde_json::Value`] rather than bytes because commands arrive
/// inside a JSON array and are decoded per element, so one bad command does
/// not poison the batch.
///
/// # Errors
///
/// Returns [`CodecError`] if the element is malformed or fails validation.
pub fn decode_remote_command(value: serde_json::Value) -> Result<RemoteCommand, CodecError> {
    let command: RemoteCommand = serde_json::from_value(value)?;
    command.validate()?;
    Ok(command)
}
