//! `Uplink` Agent -- relay between audio-processing servers and the
//! `Uplink` control plane.
//!
//! Consumes usage, session, and quota queues from the broker, enriches
//! and delivers each message over HTTP with bounded retries, dead-letters
//! terminal failures, and answers remote commands from the control plane.

pub mod command;
pub mod config;
pub mod consumer;
pub mod delivery;
pub mod heartbeat;
pub mod http;
pub mod metrics;
pub mod queue;
pub mod runtime;
pub mod shutdown;

pub use config::AgentConfig;
pub use runtime::Agent;
