//! Shared storage seams
//!
//! The serialized contract travels between processes only through a named
//! storage entry (a ConfigMap in a cluster, a mounted file on a data-plane
//! pod). The control plane writes through [`ContractStorage`]; data-plane
//! replicas read through [`ContractSource`], whose change stream is push
//! based so watchers never poll.

use crate::error::Result;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use tokio::sync::watch;

/// Write side of the shared storage entry
#[async_trait]
pub trait ContractStorage: Send + Sync + 'static {
    /// Obtain the storage entry, creating it when missing. Returns the stored
    /// payload, if any, so the caller can resume from the last published
    /// generation.
    async fn get_or_create(&self) -> Result<Option<Vec<u8>>>;

    /// Replace the stored payload. The write itself is the change signal.
    async fn write(&self, payload: Vec<u8>) -> Result<()>;
}

/// Read side of the shared storage entry
#[async_trait]
pub trait ContractSource: Send + Sync + 'static {
    /// Read the current payload; `None` when the entry does not exist yet
    async fn read(&self) -> Result<Option<Vec<u8>>>;

    /// Stream that yields once per observed change to the entry. Bursts of
    /// changes may be coalesced into a single item.
    fn changes(&self) -> Result<BoxStream<'static, ()>>;
}

/// In-memory storage entry, used by standalone deployments and tests.
///
/// Implements both sides, so a publisher and any number of watchers in the
/// same process can share one instance.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    tx: Arc<watch::Sender<Option<Vec<u8>>>>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    /// Create an empty storage entry
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Current raw payload
    pub fn payload(&self) -> Option<Vec<u8>> {
        self.tx.borrow().clone()
    }

    /// Replace the payload and notify watchers
    pub fn set(&self, payload: Vec<u8>) {
        self.tx.send_replace(Some(payload));
    }
}

#[async_trait]
impl ContractStorage for MemoryStorage {
    async fn get_or_create(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.payload())
    }

    async fn write(&self, payload: Vec<u8>) -> Result<()> {
        self.set(payload);
        Ok(())
    }
}

#[async_trait]
impl ContractSource for MemoryStorage {
    async fn read(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.payload())
    }

    fn changes(&self) -> Result<BoxStream<'static, ()>> {
        let rx = self.tx.subscribe();
        Ok(stream::unfold(rx, |mut rx| async move {
            rx.changed().await.ok().map(|_| ((), rx))
        })
        .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_write_then_read() {
        let storage = MemoryStorage::new();
        assert!(ContractSource::read(&storage).await.unwrap().is_none());

        storage.write(b"{}".to_vec()).await.unwrap();
        assert_eq!(
            ContractSource::read(&storage).await.unwrap(),
            Some(b"{}".to_vec())
        );
        assert_eq!(
            storage.get_or_create().await.unwrap(),
            Some(b"{}".to_vec())
        );
    }

    #[tokio::test]
    async fn test_changes_notify_after_subscribe() {
        let storage = MemoryStorage::new();
        storage.set(b"before".to_vec());

        let mut changes = storage.changes().unwrap();
        // Writes before subscribing are not replayed as changes.
        let pending = tokio::time::timeout(Duration::from_millis(20), changes.next()).await;
        assert!(pending.is_err());

        storage.set(b"after".to_vec());
        let next = tokio::time::timeout(Duration::from_secs(1), changes.next())
            .await
            .unwrap();
        assert_eq!(next, Some(()));
    }
}
