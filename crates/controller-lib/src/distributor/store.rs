//! Versioned configuration store
//!
//! Holds every published revision of each configuration document, keyed by
//! config name. Publication is content-addressed: a document whose SHA-256
//! hash equals the latest revision is rejected as a no-op before any side
//! effect happens.

use crate::error::{PipelineError, Result};
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// One published revision of a configuration document.
#[derive(Debug, Clone)]
pub struct ConfigVersion {
    /// Monotonic revision number within the config key, starting at 1.
    pub version: u64,
    /// Hex-encoded SHA-256 of the canonical JSON document.
    pub hash: String,
    pub document: serde_json::Value,
    pub published_at: i64,
}

/// Outcome of a successful publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOutcome {
    pub key: String,
    pub hash: String,
    pub version: u64,
}

/// Compute the content hash of a document.
///
/// `serde_json::Value` keeps object keys sorted, so serializing the value
/// yields a canonical byte string for hashing.
pub fn content_hash<T: Serialize>(document: &T) -> Result<String> {
    let value = serde_json::to_value(document)?;
    let bytes = serde_json::to_vec(&value)?;

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Content-addressed, versioned store of configuration documents.
#[derive(Clone, Default)]
pub struct VersionedStore {
    revisions: DashMap<String, Vec<ConfigVersion>>,
}

impl VersionedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a validated document under a key.
    ///
    /// Fails with [`PipelineError::NoOp`] when the hash matches the latest
    /// revision; nothing is written in that case.
    pub fn publish<T: Serialize>(&self, key: &str, document: &T) -> Result<PublishOutcome> {
        let hash = content_hash(document)?;
        let value = serde_json::to_value(document)?;

        let mut revisions = self.revisions.entry(key.to_string()).or_default();

        if let Some(latest) = revisions.last() {
            if latest.hash == hash {
                return Err(PipelineError::NoOp(hash));
            }
        }

        let version = revisions.len() as u64 + 1;
        revisions.push(ConfigVersion {
            version,
            hash: hash.clone(),
            document: value,
            published_at: Utc::now().timestamp(),
        });

        Ok(PublishOutcome {
            key: key.to_string(),
            hash,
            version,
        })
    }

    /// Latest revision for a key.
    pub fn latest(&self, key: &str) -> Option<ConfigVersion> {
        self.revisions
            .get(key)
            .and_then(|revs| revs.last().cloned())
    }

    /// Full revision history for a key, oldest first.
    pub fn history(&self, key: &str) -> Vec<ConfigVersion> {
        self.revisions
            .get(key)
            .map(|revs| revs.clone())
            .unwrap_or_default()
    }
}
