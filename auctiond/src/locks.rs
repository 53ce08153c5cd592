//! Fine-grained per-slot locking.
//!
//! One lazily-created mutex per (day, slot, gpu) serializes bids and
//! releases on the same entry while unrelated entries proceed in parallel.
//! Multi-target operations acquire in the canonical `SlotRef` order
//! (day, slot, gpu ascending) and release in reverse; slot locks are always
//! taken before the global state lock. Deadlock freedom follows from the
//! total order.
//!
//! Locks are never removed: the active keyspace is bounded
//! (7 days x 24 hours x 8 GPUs), so the map stays small.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};

use crate::model::SlotRef;

type SlotMutex = Arc<Mutex<()>>;

#[derive(Default)]
pub struct SlotLockMap {
    inner: Mutex<HashMap<SlotRef, SlotMutex>>,
}

/// Held per-slot locks. Dropping releases them in reverse acquisition order.
pub struct SlotGuard {
    guards: Vec<ArcMutexGuard<RawMutex, ()>>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        while self.guards.pop().is_some() {}
    }
}

impl SlotLockMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, target: &SlotRef) -> SlotMutex {
        self.inner
            .lock()
            .entry(target.clone())
            .or_default()
            .clone()
    }

    /// Lock a single entry.
    pub fn acquire(&self, target: &SlotRef) -> SlotGuard {
        SlotGuard {
            guards: vec![self.handle(target).lock_arc()],
        }
    }

    /// Lock a set of entries in canonical order (sorted, deduplicated).
    pub fn acquire_ordered(&self, targets: &[SlotRef]) -> SlotGuard {
        let mut sorted: Vec<&SlotRef> = targets.iter().collect();
        sorted.sort();
        sorted.dedup();

        SlotGuard {
            guards: sorted
                .into_iter()
                .map(|t| self.handle(t).lock_arc())
                .collect(),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn r(day: &str, slot: &str, gpu: u32) -> SlotRef {
        SlotRef::new(day, slot, gpu)
    }

    #[test]
    fn locks_are_created_lazily_and_deduplicated() {
        let map = SlotLockMap::new();
        assert_eq!(map.len(), 0);

        let targets = vec![
            r("2025-06-15", "2025-06-15T09:00", 1),
            r("2025-06-15", "2025-06-15T09:00", 1),
            r("2025-06-15", "2025-06-15T09:00", 0),
        ];
        let guard = map.acquire_ordered(&targets);
        assert_eq!(map.len(), 2);
        drop(guard);
    }

    #[test]
    fn same_entry_is_mutually_exclusive() {
        let map = Arc::new(SlotLockMap::new());
        let target = r("2025-06-15", "2025-06-15T09:00", 3);

        let guard = map.acquire(&target);
        assert!(map.handle(&target).try_lock().is_none());
        drop(guard);
        assert!(map.handle(&target).try_lock().is_some());
    }

    #[test]
    fn disjoint_entries_do_not_block_each_other() {
        let map = SlotLockMap::new();
        let a = map.acquire(&r("2025-06-15", "2025-06-15T09:00", 0));
        let b = map.acquire(&r("2025-06-15", "2025-06-15T09:00", 1));
        drop((a, b));
    }

    #[test]
    fn concurrent_ordered_acquisition_does_not_deadlock() {
        let map = Arc::new(SlotLockMap::new());
        let forward: Vec<SlotRef> = (0..8).map(|g| r("2025-06-15", "2025-06-15T09:00", g)).collect();
        let mut reverse = forward.clone();
        reverse.reverse();

        let m1 = Arc::clone(&map);
        let t1 = std::thread::spawn(move || {
            for _ in 0..200 {
                let _g = m1.acquire_ordered(&forward);
            }
        });
        let m2 = Arc::clone(&map);
        let t2 = std::thread::spawn(move || {
            for _ in 0..200 {
                let _g = m2.acquire_ordered(&reverse);
            }
        });

        t1.join().unwrap();
        t2.join().unwrap();
    }
}
