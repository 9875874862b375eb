// src/terrain/inflight.rs
// Collapses concurrent requests for the same key into one computation
// RELEVANT FILES: src/terrain/layer.rs

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use once_cell::sync::OnceCell;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Table of computations currently running, one per key.
///
/// Every caller for a key shares one result cell. The first to reach it
/// runs the computation; callers arriving meanwhile block and receive a
/// clone of that result. If the running computation panics, a waiting
/// caller takes over with its own. The entry is dropped once a caller is
/// done with it, so a later call computes afresh.
pub struct InFlightTable<K, V> {
    cells: Mutex<HashMap<K, Arc<OnceCell<V>>>>,
}

impl<K, V> Default for InFlightTable<K, V> {
    fn default() -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> std::fmt::Debug for InFlightTable<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightTable")
            .field("in_flight", &lock(&self.cells).len())
            .finish()
    }
}

impl<K, V> InFlightTable<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with a computation in progress
    pub fn len(&self) -> usize {
        lock(&self.cells).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `compute` for `key` unless another thread already is, in which
    /// case wait for and return that thread's result.
    pub fn run<F>(&self, key: K, compute: F) -> V
    where
        F: FnOnce() -> V,
    {
        let cell = lock(&self.cells)
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let _release = Release {
            table: self,
            key: &key,
            cell: &cell,
        };
        cell.get_or_init(compute).clone()
    }
}

/// Removes the caller's cell from the table on return or unwind
struct Release<'a, K, V>
where
    K: Eq + Hash,
{
    table: &'a InFlightTable<K, V>,
    key: &'a K,
    cell: &'a Arc<OnceCell<V>>,
}

impl<K, V> Drop for Release<'_, K, V>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        let mut cells = lock(&self.table.cells);
        if cells
            .get(self.key)
            .map_or(false, |current| Arc::ptr_eq(current, self.cell))
        {
            cells.remove(self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_concurrent_callers_share_one_computation() {
        let table = Arc::new(InFlightTable::<u32, u64>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = table.clone();
                let calls = calls.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    table.run(7, || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(100));
                        42
                    })
                })
            })
            .collect();

        for h in handles {
            assert_eq!(h.join().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_sequential_calls_recompute() {
        let table = InFlightTable::<&str, usize>::new();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            table.run("a", || calls.fetch_add(1, Ordering::SeqCst));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_panicking_leader_releases_waiters() {
        let table = Arc::new(InFlightTable::<u8, u8>::new());
        let t = table.clone();
        let leader = thread::spawn(move || {
            t.run(1, || {
                thread::sleep(Duration::from_millis(50));
                panic!("source exploded");
            })
        });
        thread::sleep(Duration::from_millis(10));
        let follower = table.run(1, || 9);
        assert_eq!(follower, 9);
        assert!(leader.join().is_err());
        assert!(table.is_empty());
    }

    #[test]
    fn test_distinct_keys_run_independently() {
        let table = InFlightTable::<u8, u8>::new();
        let inner = table.run(1, || table.run(2, || 5) + 1);
        assert_eq!(inner, 6);
        assert!(table.is_empty());
    }
}
