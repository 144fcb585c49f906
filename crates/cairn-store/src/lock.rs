use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Wait queue for one held key. Presence of a key in the table means the
/// key is held; the queue holds wakers for blocked acquirers, FIFO.
#[derive(Default)]
struct KeyState {
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// Per-key cooperative mutual exclusion with FIFO waiters.
///
/// Serializes operations that touch the same session without blocking
/// unrelated sessions. Release hands the key directly to the front waiter,
/// so grant order is arrival order of the acquire calls. The table itself
/// is guarded by a std mutex that is never held across an await; waiting
/// happens on a oneshot channel after the table lock is dropped.
///
/// In-process only: nothing here protects against a second OS process
/// sharing the same base path.
#[derive(Clone, Default)]
pub struct SessionLocks {
    table: Arc<Mutex<HashMap<String, KeyState>>>,
}

/// Snapshot of lock-table state, for diagnostics.
#[derive(Debug, Clone)]
pub struct LockStatus {
    /// Number of currently held keys.
    pub active_keys: usize,
    /// Queue depth per held key (only keys with waiters are listed).
    pub queue_depths: HashMap<String, usize>,
}

impl LockStatus {
    /// Total number of blocked acquirers across all keys.
    pub fn total_waiters(&self) -> usize {
        self.queue_depths.values().sum()
    }
}

impl SessionLocks {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, KeyState>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquires the lock for `key`, waiting FIFO behind current holders.
    ///
    /// The returned guard releases on drop, handing the key to the next
    /// waiter if one exists. There is no timeout: a holder that never
    /// drops its guard starves every later acquirer of the same key.
    pub async fn acquire(&self, key: &str) -> LockGuard {
        let waiter = {
            let mut table = self.table();
            match table.get_mut(key) {
                None => {
                    table.insert(key.to_string(), KeyState::default());
                    None
                }
                Some(state) => {
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push_back(tx);
                    Some(rx)
                }
            }
        };
        if let Some(rx) = waiter {
            debug!(key, "waiting for session lock");
            // A closed channel means the holder vanished without a
            // hand-off (force release mid-teardown); proceed regardless.
            let _ = rx.await;
        }
        LockGuard {
            locks: self.clone(),
            key: key.to_string(),
        }
    }

    /// Clears every held key and wakes every waiter immediately.
    ///
    /// Unsafe by design: woken waiters resume believing they hold the
    /// lock, so two operations can run "exclusively" at once. Strictly a
    /// last resort for shutdown and crash recovery, never steady state.
    pub fn force_release_all(&self) {
        let mut table = self.table();
        if table.is_empty() {
            return;
        }
        let keys: Vec<String> = table.keys().cloned().collect();
        warn!(?keys, "force-releasing all session locks");
        for (_, mut state) in table.drain() {
            while let Some(tx) = state.waiters.pop_front() {
                let _ = tx.send(());
            }
        }
    }

    /// Reports held-key count and per-key queue depth.
    pub fn status(&self) -> LockStatus {
        let table = self.table();
        LockStatus {
            active_keys: table.len(),
            queue_depths: table
                .iter()
                .filter(|(_, state)| !state.waiters.is_empty())
                .map(|(key, state)| (key.clone(), state.waiters.len()))
                .collect(),
        }
    }
}

/// Exclusive hold on one key; releases (or hands off) on drop.
pub struct LockGuard {
    locks: SessionLocks,
    key: String,
}

impl LockGuard {
    /// The key this guard holds.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let mut table = self.locks.table();
        if let Some(state) = table.get_mut(&self.key) {
            // Hand off to the first waiter still listening; a cancelled
            // waiter's closed channel just moves us to the next one.
            while let Some(tx) = state.waiters.pop_front() {
                if tx.send(()).is_ok() {
                    return;
                }
            }
            table.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test]
    async fn free_key_acquires_immediately() {
        let locks = SessionLocks::new();
        let guard = locks.acquire("a").await;
        assert_eq!(guard.key(), "a");
        assert_eq!(locks.status().active_keys, 1);
        drop(guard);
        assert_eq!(locks.status().active_keys, 0);
    }

    #[tokio::test]
    async fn waiters_are_granted_in_fifo_order() {
        let locks = SessionLocks::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = locks.acquire("k").await;
        let mut handles = Vec::new();
        for i in 0..3 {
            let locks = locks.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("k").await;
                order.lock().unwrap().push(i);
            }));
            // Let each task enqueue before spawning the next.
            sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(locks.status().queue_depths.get("k"), Some(&3));
        drop(first);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(locks.status().active_keys, 0);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_contend() {
        let locks = SessionLocks::new();
        let _a = locks.acquire("a").await;
        // Must not block even though "a" is held.
        let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire("b")).await;
        assert!(b.is_ok());
        assert_eq!(locks.status().active_keys, 2);
    }

    #[tokio::test]
    async fn force_release_wakes_all_waiters() {
        let locks = SessionLocks::new();
        let holder = locks.acquire("k").await;

        let mut handles = Vec::new();
        for _ in 0..2 {
            let locks = locks.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("k").await;
            }));
        }
        sleep(Duration::from_millis(50)).await;

        locks.force_release_all();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .unwrap()
                .unwrap();
        }
        // Holder's eventual drop finds nothing to release.
        drop(holder);
        assert_eq!(locks.status().active_keys, 0);
    }

    #[tokio::test]
    async fn cancelled_waiter_is_skipped_on_hand_off() {
        let locks = SessionLocks::new();
        let holder = locks.acquire("k").await;

        // Enqueue a waiter, then cancel it before the hand-off.
        let cancelled = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire("k").await;
            })
        };
        sleep(Duration::from_millis(20)).await;
        cancelled.abort();
        let _ = cancelled.await;

        let live = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire("k").await;
                true
            })
        };
        sleep(Duration::from_millis(20)).await;

        drop(holder);
        assert!(tokio::time::timeout(Duration::from_secs(1), live)
            .await
            .unwrap()
            .unwrap());
    }
}
