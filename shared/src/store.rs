use std::sync::Arc;

use tokio::sync::RwLock;

use crate::Snapshot;

/// Key-to-table storage for the latest snapshot.
///
/// `replace` swaps both tables as one unit: readers see either the previous
/// snapshot or the new one, never a mix.
#[async_trait::async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn replace(&self, snapshot: Snapshot) -> anyhow::Result<()>;

    async fn current(&self) -> anyhow::Result<Option<Snapshot>>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshot: RwLock<Option<Arc<Snapshot>>>,
}

impl MemoryStore {
    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            snapshot: RwLock::new(Some(Arc::new(snapshot))),
        }
    }
}

#[async_trait::async_trait]
impl SnapshotStore for MemoryStore {
    async fn replace(&self, snapshot: Snapshot) -> anyhow::Result<()> {
        *self.snapshot.write().await = Some(Arc::new(snapshot));
        Ok(())
    }

    async fn current(&self) -> anyhow::Result<Option<Snapshot>> {
        Ok(self.snapshot.read().await.as_deref().cloned())
    }
}
