//! Tunnel domain tracking
//!
//! Single owner of the identity record once bootstrap is done. Hostnames
//! found by the supervisor arrive over a channel and are applied one at a
//! time: update the record, persist it, republish the links.

use tokio::sync::mpsc;
use tracing::{error, info};

use crate::identity::IdentityRecord;
use crate::links::LinkPublisher;
use crate::store::ConfigStore;

/// Result of applying one observed hostname
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainUpdate {
    /// Same as the current domain, nothing written
    Unchanged,
    /// Record updated, persisted and published
    Applied,
    /// Record updated in memory but persisting or publishing failed; the
    /// next observation retries
    Degraded,
}

pub struct DomainTracker {
    record: IdentityRecord,
    store: ConfigStore,
    publisher: LinkPublisher,
    dirty: bool,
}

impl DomainTracker {
    pub fn new(record: IdentityRecord, store: ConfigStore, publisher: LinkPublisher) -> Self {
        Self {
            record,
            store,
            publisher,
            dirty: false,
        }
    }

    pub fn record(&self) -> &IdentityRecord {
        &self.record
    }

    /// Apply a hostname reported by the tunnel client.
    pub fn observe(&mut self, host: &str) -> DomainUpdate {
        if host == self.record.tunnel_domain && !self.dirty {
            return DomainUpdate::Unchanged;
        }

        if host != self.record.tunnel_domain {
            info!(
                from = %self.record.tunnel_domain,
                to = %host,
                "Tunnel domain changed"
            );
            self.record.tunnel_domain = host.to_string();
        }

        let mut ok = true;
        if let Err(e) = self.store.persist(&self.record) {
            error!(error = %e, path = %self.store.path().display(), "Failed to persist tunnel domain");
            ok = false;
        }
        if let Err(e) = self.publisher.publish(&self.record) {
            error!(error = %e, path = %self.publisher.path().display(), "Failed to publish links");
            ok = false;
        }

        self.dirty = !ok;
        if ok {
            DomainUpdate::Applied
        } else {
            DomainUpdate::Degraded
        }
    }

    /// Apply hostnames until every sender is gone.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<String>) -> IdentityRecord {
        while let Some(host) = rx.recv().await {
            self.observe(&host);
        }
        self.record
    }
}
