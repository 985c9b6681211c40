//! Queue consumption: decode, enrich, deliver, acknowledge or dead-letter.

mod dead_letter;
mod enrich;
mod pipelines;
mod worker;

pub use dead_letter::{DeadLetterError, DeadLetterSink};
pub use enrich::Enricher;
pub use pipelines::{QuotaPipeline, SessionPipeline, UsagePipeline};
pub use worker::ConsumerWorker;

use async_trait::async_trait;
use uplink_core::CodecError;

/// Why a message could not be processed to an accepted delivery.
///
/// Both variants are terminal for the message: the worker dead-letters it
/// rather than leaving it on the queue. Validation failures carry zero
/// attempts since no request was ever sent.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Validation(#[from] CodecError),
    #[error("delivery failed after {attempts} attempt(s): {reason}")]
    Delivery { attempts: u32, reason: String },
}

/// One queue's decode-and-deliver logic, driven by a [`ConsumerWorker`].
#[async_trait]
pub trait QueuePipeline: Send + Sync + 'static {
    /// Logical queue name, used for metrics labels and dead-letter entries.
    fn queue(&self) -> &'static str;

    /// Resolved broker list name the worker pops from.
    fn broker_queue(&self) -> &str;

    /// Processes one raw payload to a terminal outcome.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Validation`] when the payload does not
    /// decode, and [`PipelineError::Delivery`] when the control plane
    /// rejected the message or stayed unreachable through the retry
    /// budget.
    async fn process(&self, payload: &[u8], correlation_id: &str) -> Result<(), PipelineError>;
}
