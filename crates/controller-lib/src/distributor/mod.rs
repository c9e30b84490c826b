//! Configuration distribution
//!
//! The distributor is the entry point for configuration changes: it
//! validates incoming documents, content-hashes them, appends them to the
//! versioned store, and notifies subscribed supervisors through watch
//! channels. Re-submitting an unchanged document is a no-op and triggers no
//! redeployment.

mod store;
mod validate;

pub use store::{content_hash, ConfigVersion, PublishOutcome, VersionedStore};
pub use validate::{validate_collector, validate_estimation};

use crate::error::Result;
use crate::models::{CollectorConfig, EstimationServiceSpec};
use tokio::sync::watch;
use tracing::info;

/// Config keys in the versioned store.
pub mod keys {
    pub const COLLECTOR: &str = "collector";
    pub const ESTIMATION: &str = "estimation";
}

/// A validated, published configuration carried to subscribers.
#[derive(Debug, Clone)]
pub struct Published<T> {
    pub hash: String,
    pub version: u64,
    pub config: T,
}

/// Validates, versions, and distributes configuration documents.
pub struct ConfigDistributor {
    store: VersionedStore,
    collector_tx: watch::Sender<Option<Published<CollectorConfig>>>,
    estimation_tx: watch::Sender<Option<Published<EstimationServiceSpec>>>,
}

impl Default for ConfigDistributor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigDistributor {
    pub fn new() -> Self {
        let (collector_tx, _) = watch::channel(None);
        let (estimation_tx, _) = watch::channel(None);
        Self {
            store: VersionedStore::new(),
            collector_tx,
            estimation_tx,
        }
    }

    /// Validate and publish a collector configuration.
    pub fn publish_collector(&self, config: CollectorConfig) -> Result<PublishOutcome> {
        validate_collector(&config)?;

        let outcome = self.store.publish(keys::COLLECTOR, &config)?;
        info!(
            hash = %outcome.hash,
            version = outcome.version,
            "Published collector configuration"
        );

        self.collector_tx.send_replace(Some(Published {
            hash: outcome.hash.clone(),
            version: outcome.version,
            config,
        }));

        Ok(outcome)
    }

    /// Validate and publish an estimation service configuration.
    pub fn publish_estimation(&self, spec: EstimationServiceSpec) -> Result<PublishOutcome> {
        validate_estimation(&spec)?;

        let outcome = self.store.publish(keys::ESTIMATION, &spec)?;
        info!(
            hash = %outcome.hash,
            version = outcome.version,
            "Published estimation configuration"
        );

        self.estimation_tx.send_replace(Some(Published {
            hash: outcome.hash.clone(),
            version: outcome.version,
            config: spec,
        }));

        Ok(outcome)
    }

    /// Subscribe to collector configuration changes.
    pub fn subscribe_collector(&self) -> watch::Receiver<Option<Published<CollectorConfig>>> {
        self.collector_tx.subscribe()
    }

    /// Subscribe to estimation configuration changes.
    pub fn subscribe_estimation(
        &self,
    ) -> watch::Receiver<Option<Published<EstimationServiceSpec>>> {
        self.estimation_tx.subscribe()
    }

    /// Latest published revision for a config key.
    pub fn latest(&self, key: &str) -> Option<ConfigVersion> {
        self.store.latest(key)
    }

    /// Revision history for a config key, oldest first.
    pub fn history(&self, key: &str) -> Vec<ConfigVersion> {
        self.store.history(key)
    }
}
