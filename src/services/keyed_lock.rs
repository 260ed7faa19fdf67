//! Per-key async mutual exclusion.
//!
//! Each key gets its own `tokio::sync::Mutex`, created on first use and dropped
//! from the registry once the last holder or waiter lets go, including waiters
//! whose future is dropped before acquiring. Different keys never contend.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

struct Slot {
    lock: Arc<AsyncMutex<()>>,
    // Holders plus waiters.
    users: usize,
}

type Registry<K> = Arc<Mutex<HashMap<K, Slot>>>;

pub struct KeyedLocks<K> {
    locks: Registry<K>,
}

impl<K> std::fmt::Debug for KeyedLocks<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedLocks").finish_non_exhaustive()
    }
}

impl<K> Clone for KeyedLocks<K> {
    fn clone(&self) -> Self {
        Self {
            locks: Arc::clone(&self.locks),
        }
    }
}

impl<K> Default for KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Waits for exclusive access to `key`. Access ends when the guard drops.
    pub async fn lock(&self, key: K) -> KeyedGuard<K> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            let slot = locks.entry(key.clone()).or_insert_with(|| Slot {
                lock: Arc::new(AsyncMutex::new(())),
                users: 0,
            });
            slot.users += 1;
            Arc::clone(&slot.lock)
        };
        // Registered before the await so a cancelled wait still checks out.
        let ticket = Ticket {
            key: Some(key),
            registry: Arc::clone(&self.locks),
        };

        let guard = lock.lock_owned().await;

        KeyedGuard {
            _guard: guard,
            _ticket: ticket,
        }
    }

    /// Number of keys currently held or awaited.
    pub fn active_keys(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

struct Ticket<K>
where
    K: Eq + Hash,
{
    key: Option<K>,
    registry: Registry<K>,
}

impl<K> Drop for Ticket<K>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };
        let mut locks = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        let vacant = match locks.get_mut(&key) {
            Some(slot) => {
                slot.users = slot.users.saturating_sub(1);
                slot.users == 0
            }
            None => false,
        };
        if vacant {
            locks.remove(&key);
        }
    }
}

/// Exclusive access to one key.
pub struct KeyedGuard<K>
where
    K: Eq + Hash,
{
    // Fields drop in order: the mutex is released before the ticket checks out.
    _guard: OwnedMutexGuard<()>,
    _ticket: Ticket<K>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_serialized() {
        let locks = KeyedLocks::<i64>::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(42).await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(locks.active_keys(), 0);
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = KeyedLocks::<i64>::new();
        let _a = locks.lock(1).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock(2)).await;
        assert!(b.is_ok());
        assert_eq!(locks.active_keys(), 2);
    }

    #[tokio::test]
    async fn registry_is_cleaned_after_release() {
        let locks = KeyedLocks::<String>::new();
        {
            let _guard = locks.lock("user".to_string()).await;
            assert_eq!(locks.active_keys(), 1);
        }
        assert_eq!(locks.active_keys(), 0);
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_leak_its_key() {
        let locks = KeyedLocks::<i64>::new();
        let held = locks.lock(7).await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(7).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());
        assert_eq!(locks.active_keys(), 1);

        drop(held);
        assert_eq!(locks.active_keys(), 0);
    }

    #[tokio::test]
    async fn timed_out_waiters_release_in_any_order() {
        let locks = KeyedLocks::<i64>::new();
        let held = locks.lock(9).await;

        for _ in 0..3 {
            let attempt = tokio::time::timeout(Duration::from_millis(5), locks.lock(9)).await;
            assert!(attempt.is_err());
        }
        assert_eq!(locks.active_keys(), 1);

        let queued = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.lock(9).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);
        let guard = queued.await.unwrap();
        assert_eq!(locks.active_keys(), 1);
        drop(guard);
        assert_eq!(locks.active_keys(), 0);
    }
}
