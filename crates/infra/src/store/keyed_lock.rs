//! Per-key async mutexes with bounded, ordered acquisition.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::StoreError;

/// Table size below which idle slots are left in place.
const MIN_PRUNE_AT: usize = 64;

/// A lazily populated table of async mutexes, one per key.
///
/// Holders of different keys never contend. Multi-key acquisition sorts the
/// keys first so two writers can never wait on each other in a cycle. Slots
/// nobody holds or waits on are evicted once the table doubles in size.
#[derive(Debug)]
pub struct KeyedLocks<K> {
    table: Mutex<LockTable<K>>,
}

#[derive(Debug)]
struct LockTable<K> {
    slots: HashMap<K, Arc<AsyncMutex<()>>>,
    prune_at: usize,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            table: Mutex::new(LockTable {
                slots: HashMap::new(),
                prune_at: MIN_PRUNE_AT,
            }),
        }
    }
}

impl<K: Eq + Hash> LockTable<K> {
    /// Drop slots whose only reference is the table itself. Guards and
    /// pending `lock_owned` futures each hold a clone, so live slots stay.
    fn prune_idle(&mut self) {
        self.slots.retain(|_, slot| Arc::strong_count(slot) > 1);
        self.prune_at = (self.slots.len() * 2).max(MIN_PRUNE_AT);
    }
}

impl<K> KeyedLocks<K>
where
    K: Ord + Hash + Clone + Debug,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &K) -> Result<Arc<AsyncMutex<()>>, StoreError> {
        let mut table = self
            .table
            .lock()
            .map_err(|_| StoreError::Backend("lock table poisoned".to_string()))?;
        if table.slots.len() >= table.prune_at {
            table.prune_idle();
        }
        Ok(table.slots.entry(key.clone()).or_default().clone())
    }

    pub async fn lock(&self, key: &K, timeout: Duration) -> Result<OwnedMutexGuard<()>, StoreError> {
        let slot = self.slot(key)?;
        tokio::time::timeout(timeout, slot.lock_owned())
            .await
            .map_err(|_| StoreError::LockTimeout(format!("{key:?} after {}ms", timeout.as_millis())))
    }

    /// Lock every key in ascending order. Duplicates are locked once.
    pub async fn lock_all(
        &self,
        keys: impl IntoIterator<Item = K>,
        timeout: Duration,
    ) -> Result<Vec<OwnedMutexGuard<()>>, StoreError> {
        let mut keys: Vec<K> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            guards.push(self.lock(key, timeout).await?);
        }
        Ok(guards)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn held_keys_time_out_and_free_keys_do_not() {
        let locks: KeyedLocks<u32> = KeyedLocks::new();
        let _held = locks.lock(&1, Duration::from_millis(50)).await.unwrap();

        let err = locks.lock(&1, Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout(_)));
        assert!(err.is_transient());

        assert!(locks.lock(&2, Duration::from_millis(20)).await.is_ok());
    }

    #[tokio::test]
    async fn lock_all_dedups_and_releases_on_drop() {
        let locks: KeyedLocks<u32> = KeyedLocks::new();
        {
            let guards = locks
                .lock_all(vec![3, 1, 3, 2], Duration::from_millis(50))
                .await
                .unwrap();
            assert_eq!(guards.len(), 3);
        }
        assert!(locks.lock(&3, Duration::from_millis(20)).await.is_ok());
    }

    #[tokio::test]
    async fn released_slots_are_evicted_as_the_table_grows() {
        let locks: KeyedLocks<u32> = KeyedLocks::new();
        let held = locks.lock(&0, Duration::from_millis(50)).await.unwrap();
        for key in 1..=1000 {
            drop(locks.lock(&key, Duration::from_millis(50)).await.unwrap());
        }

        let size = locks.table.lock().unwrap().slots.len();
        assert!(size < 2 * MIN_PRUNE_AT, "table kept {size} slots");
        assert!(locks.table.lock().unwrap().slots.contains_key(&0));

        let err = locks.lock(&0, Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout(_)));
        drop(held);
        assert!(locks.lock(&0, Duration::from_millis(20)).await.is_ok());
    }
}
