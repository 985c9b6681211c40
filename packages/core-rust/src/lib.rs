//! `Uplink` Core -- record schemas, remote commands, validation, and codec.
//!
//! Shared between the relay agent and the upstream audio-processing servers
//! that produce the queue payloads. Pure data: serde types, validation
//! rules, and the JSON codec. No I/O.

pub mod codec;
pub mod records;
pub mod validate;

pub use codec::{
    decode_quota_request, decode_remote_command, decode_session_event, decode_usage_record,
    CodecError,
};
pub use records::{
    CommandResult, CommandType, DeadLetterEntry, DeadLetterReason, EnrichedUsageRecord, Heartbeat,
    ProductCode, QuotaRefreshRequest, QuotaRefreshResponse, RemoteCommand, ServerRegistration,
    ServerStatus, SessionEventType, SessionLifecycleEvent, UsageRecord,
};
pub use validate::ValidationError;

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
