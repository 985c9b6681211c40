//! Stamps validated usage records with the relaying server's identity.

use chrono::Utc;

use uplink_core::{EnrichedUsageRecord, UsageRecord};

use crate::config::ServerIdentity;

/// Adds server metadata to validated records. Enrichment never touches
/// the original fields; the control plane sees exactly what the upstream
/// server reported, plus provenance.
#[derive(Debug, Clone)]
pub struct Enricher {
    server_id: String,
    region: String,
    version: String,
}

impl Enricher {
    #[must_use]
    pub fn new(identity: &ServerIdentity) -> Self {
        Self {
            server_id: identity.server_id.clone(),
            region: identity.region.clone(),
            version: identity.version.clone(),
        }
    }

    /// Wraps a validated record with provenance, stamped now.
    #[must_use]
    pub fn enrich(&self, record: UsageRecord) -> EnrichedUsageRecord {
        EnrichedUsageRecord {
            record,
            server_id: self.server_id.clone(),
            server_region: self.region.clone(),
            processed_at: Utc::now(),
            agent_version: self.version.clone(),
        }
    }
}
