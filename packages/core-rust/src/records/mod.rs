//! Wire-facing record types exchanged with upstream servers and the
//! control plane.
//!
//! All types serialize as snake_case JSON. Inbound queue records
//! ([`UsageRecord`], [`SessionLifecycleEvent`], [`QuotaRefreshRequest`],
//! [`RemoteCommand`]) carry a `validate()` applied at the codec boundary;
//! outbound types are constructed by the agent and need no validation.

pub mod command;
pub mod deadletter;
pub mod quota;
pub mod server;
pub mod session;
pub mod usage;

pub use command::{CommandResult, CommandType, RemoteCommand};
pub use deadletter::{DeadLetterEntry, DeadLetterReason};
pub use quota::{QuotaRefreshRequest, QuotaRefreshResponse};
pub use server::{Heartbeat, ServerRegistration, ServerStatus};
pub use session::{SessionEventType, SessionLifecycleEvent};
pub use usage::{EnrichedUsageRecord, ProductCode, UsageRecord};
