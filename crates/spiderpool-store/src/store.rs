use crate::event::ResourceEvent;
use crate::repository::Repository;
use crate::{KVStore, RedbBackend, Result};
use spiderpool_core::Resource;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// Capacity of the mutation event channel
const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// The cluster resource store: a versioned key-value backend plus a
/// broadcast channel of mutation events.
pub struct Store {
    pub(crate) kv: Arc<dyn KVStore>,
    pub(crate) event_tx: broadcast::Sender<ResourceEvent>,
}

impl Store {
    /// Open a redb-backed store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Arc<Self>> {
        let backend = RedbBackend::new(path)?;
        info!("Resource store opened");
        Ok(Self::with_backend(Arc::new(backend)))
    }

    /// Wrap an existing backend (used by tests)
    pub fn with_backend(kv: Arc<dyn KVStore>) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self { kv, event_tx })
    }

    /// Subscribe to resource mutation events
    pub fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.event_tx.subscribe()
    }

    /// Typed repository over one resource kind
    pub fn repository<T: Resource>(self: &Arc<Self>) -> Repository<T> {
        Repository::new(Arc::clone(self))
    }

    pub(crate) fn publish(&self, event: ResourceEvent) {
        // Best-effort: an event with no subscriber is simply dropped.
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spiderpool_core::SpiderIPPool;
    use tempfile::tempdir;

    #[test]
    fn test_open_and_subscribe() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("test.redb")).unwrap();
        let _rx = store.subscribe();
        let _pools: Repository<SpiderIPPool> = store.repository();
    }
}
