//! In-memory discovery store

use crate::{DiscoveryClient, DiscoveryError, DiscoveryResult, Entry};
use async_trait::async_trait;
use relaymux_proto::PublicKey;
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Process-local discovery store
///
/// Enforces the same rules as the remote service: entries must be signed by
/// their owner, can only be created once, and updates must carry a higher
/// sequence than the stored entry.
#[derive(Debug, Default)]
pub struct MemoryDiscovery {
    entries: RwLock<BTreeMap<PublicKey, Entry>>,
}

impl MemoryDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop an entry, e.g. when a relay goes away
    pub async fn remove_entry(&self, pk: &PublicKey) -> Option<Entry> {
        self.entries.write().await.remove(pk)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl DiscoveryClient for MemoryDiscovery {
    async fn entry(&self, pk: &PublicKey) -> DiscoveryResult<Entry> {
        self.entries
            .read()
            .await
            .get(pk)
            .cloned()
            .ok_or(DiscoveryError::NotFound(*pk))
    }

    async fn create_entry(&self, entry: &Entry) -> DiscoveryResult<()> {
        entry.verify()?;

        let mut entries = self.entries.write().await;
        if entries.contains_key(&entry.static_pk) {
            return Err(DiscoveryError::AlreadyExists(entry.static_pk));
        }

        debug!("Created discovery entry for {}", entry.static_pk.short());
        entries.insert(entry.static_pk, entry.clone());
        Ok(())
    }

    async fn update_entry(&self, entry: &Entry) -> DiscoveryResult<()> {
        entry.verify()?;

        let mut entries = self.entries.write().await;
        let stored = entries
            .get_mut(&entry.static_pk)
            .ok_or(DiscoveryError::NotFound(entry.static_pk))?;

        if entry.sequence <= stored.sequence {
            return Err(DiscoveryError::SequenceOutOfOrder {
                stored: stored.sequence,
                got: entry.sequence,
            });
        }

        debug!(
            "Updated discovery entry for {} (sequence {})",
            entry.static_pk.short(),
            entry.sequence
        );
        *stored = entry.clone();
        Ok(())
    }

    async fn available_servers(&self) -> DiscoveryResult<Vec<Entry>> {
        Ok(self
            .entries
            .read()
            .await
            .values()
            .filter(|e| {
                e.server
                    .as_ref()
                    .is_some_and(|s| s.available_connections > 0)
            })
            .cloned()
            .collect())
    }
}
