use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Best-effort per-pool serialization within one agent process.
///
/// Correctness does not depend on these locks; they only reduce
/// self-inflicted optimistic-write conflicts when several NICs or requests
/// target the same pool. Cross-process races are still resolved by the
/// store's revision preconditions.
#[derive(Default)]
pub struct PoolLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl PoolLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, pool: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock();
            Arc::clone(locks.entry(pool.to_string()).or_default())
        };
        mutex.lock_owned().await
    }
}
