//! Component D: maps drive paths to their async pools. Pools are created
//! lazily on first use and torn down explicitly; grounded in `drive.c`'s
//! drive-list bookkeeping (`drive_add`/`drive_delete`/`drive_list_destroy`).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::drive::async_pool::{AsyncPool, DEFAULT_POOL_THREADS};
use crate::drive::transport::DriveTransport;

/// Owns one [`AsyncPool`] per drive path, created on demand.
pub struct DriveRegistry {
    transport: Arc<dyn DriveTransport>,
    threads_per_pool: usize,
    pools: Mutex<HashMap<String, Arc<AsyncPool>>>,
}

impl DriveRegistry {
    pub fn new(transport: Arc<dyn DriveTransport>) -> Self {
        Self::with_pool_size(transport, DEFAULT_POOL_THREADS)
    }

    pub fn with_pool_size(transport: Arc<dyn DriveTransport>, threads_per_pool: usize) -> Self {
        DriveRegistry {
            transport,
            threads_per_pool,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the pool for `drive`, creating it if this is the first
    /// reference.
    pub fn get_or_create(&self, drive: &str) -> Arc<AsyncPool> {
        let mut pools = self.pools.lock().unwrap();
        pools
            .entry(drive.to_string())
            .or_insert_with(|| Arc::new(AsyncPool::new(drive, Arc::clone(&self.transport), self.threads_per_pool)))
            .clone()
    }

    /// Returns the pool for `drive` if one already exists, without
    /// creating it.
    pub fn lookup(&self, drive: &str) -> Option<Arc<AsyncPool>> {
        self.pools.lock().unwrap().get(drive).cloned()
    }

    /// Replaces `drive`'s pool with a freshly created one, dropping the
    /// old reference. Any jobs still queued on the old pool are abandoned
    /// by this registry (existing `Arc` holders may still drain them).
    pub fn replace(&self, drive: &str) -> Arc<AsyncPool> {
        let fresh = Arc::new(AsyncPool::new(drive, Arc::clone(&self.transport), self.threads_per_pool));
        self.pools.lock().unwrap().insert(drive.to_string(), Arc::clone(&fresh));
        fresh
    }

    /// Removes `drive`'s pool from the registry without destroying it;
    /// the pool runs down once its last `Arc` reference drops.
    pub fn remove(&self, drive: &str) -> Option<Arc<AsyncPool>> {
        self.pools.lock().unwrap().remove(drive)
    }

    /// Removes every pool from the registry.
    pub fn destroy_all(&self) {
        self.pools.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.pools.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::mem::MemDrive;

    #[test]
    fn get_or_create_is_idempotent() {
        let registry = DriveRegistry::new(Arc::new(MemDrive::new()));
        let a = registry.get_or_create("/dev/sd0");
        let b = registry.get_or_create("/dev/sd0");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn replace_swaps_in_a_new_pool() {
        let registry = DriveRegistry::new(Arc::new(MemDrive::new()));
        let a = registry.get_or_create("/dev/sd0");
        let b = registry.replace("/dev/sd0");
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&registry.lookup("/dev/sd0").unwrap(), &b));
    }

    #[test]
    fn remove_and_destroy_all() {
        let registry = DriveRegistry::new(Arc::new(MemDrive::new()));
        registry.get_or_create("/dev/sd0");
        registry.get_or_create("/dev/sd1");
        assert_eq!(registry.len(), 2);
        registry.remove("/dev/sd0");
        assert_eq!(registry.len(), 1);
        registry.destroy_all();
        assert!(registry.is_empty());
    }
}
