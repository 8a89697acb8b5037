// src/slab.rs
use crate::conn::Conn;
use crate::error::SyncResult;
use crate::sync::Lock;
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::error;

struct Slot {
    allocated: AtomicBool,
    owned: AtomicBool,
    conn: UnsafeCell<Conn>,
}

/// Fixed arena of connections shared by the reactor and the workers.
///
/// Indices come from an internal free list and double as epoll tokens. A
/// thread touches a slot's `Conn` only while holding its claim; one-shot
/// registration means claims never actually contend, so a failed claim is
/// an ownership bug rather than a wait condition.
pub struct ConnectionTable {
    slots: Box<[Slot]>,
    free: Lock<Vec<usize>>,
    live: AtomicUsize,
}

// Access to each `Conn` is serialised by the slot's `owned` flag.
unsafe impl Sync for ConnectionTable {}

impl ConnectionTable {
    pub fn new(capacity: usize) -> SyncResult<Self> {
        let slots = (0..capacity)
            .map(|_| Slot {
                allocated: AtomicBool::new(false),
                owned: AtomicBool::new(false),
                conn: UnsafeCell::new(Conn::empty()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        // Reversed so the lowest index is handed out first.
        let free = (0..capacity).rev().collect();

        Ok(Self {
            slots,
            free: Lock::new(free)?,
            live: AtomicUsize::new(0),
        })
    }

    /// Take a vacant slot. `None` when every slot is in use.
    pub fn allocate(&self) -> Option<usize> {
        let index = match self.free.lock() {
            Ok(mut free) => free.pop()?,
            Err(e) => {
                error!("connection free list lock failed: {}", e);
                return None;
            }
        };
        self.slots[index].allocated.store(true, Ordering::Release);
        self.live.fetch_add(1, Ordering::AcqRel);
        Some(index)
    }

    /// Return a slot to the free list. Releasing a vacant slot is a no-op.
    pub fn release(&self, index: usize) {
        let Some(slot) = self.slots.get(index) else {
            return;
        };
        if !slot.allocated.swap(false, Ordering::AcqRel) {
            return;
        }
        match self.free.lock() {
            Ok(mut free) => free.push(index),
            Err(e) => {
                error!("connection free list lock failed, slot {} leaked: {}", index, e);
                return;
            }
        }
        self.live.fetch_sub(1, Ordering::AcqRel);
    }

    /// Exclusive access to an allocated slot's connection.
    pub fn claim(&self, index: usize) -> Option<SlotGuard<'_>> {
        let slot = self.slots.get(index)?;
        if !slot.allocated.load(Ordering::Acquire) {
            return None;
        }
        slot.owned
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(SlotGuard { slot })
    }

    pub fn is_allocated(&self, index: usize) -> bool {
        self.slots
            .get(index)
            .is_some_and(|s| s.allocated.load(Ordering::Acquire))
    }

    /// Number of connections currently open.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

/// Releases the claim on drop.
pub struct SlotGuard<'a> {
    slot: &'a Slot,
}

impl Deref for SlotGuard<'_> {
    type Target = Conn;

    fn deref(&self) -> &Conn {
        unsafe { &*self.slot.conn.get() }
    }
}

impl DerefMut for SlotGuard<'_> {
    fn deref_mut(&mut self) -> &mut Conn {
        unsafe { &mut *self.slot.conn.get() }
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.slot.owned.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_slab_operations() {
        let table = ConnectionTable::new(10).unwrap();
        assert_eq!(table.live(), 0);
        assert_eq!(table.capacity(), 10);

        let idx1 = table.allocate().unwrap();
        assert_eq!(idx1, 0);
        let idx2 = table.allocate().unwrap();
        assert_eq!(idx2, 1);
        assert_eq!(table.live(), 2);

        table.release(idx1);
        assert_eq!(table.live(), 1);
        assert!(!table.is_allocated(idx1));

        // Index 0 went back on top of the free list.
        let idx3 = table.allocate().unwrap();
        assert_eq!(idx3, 0);
    }

    #[test]
    fn exhaustion_and_double_release() {
        let table = ConnectionTable::new(2).unwrap();
        let a = table.allocate().unwrap();
        let _b = table.allocate().unwrap();
        assert!(table.allocate().is_none());

        table.release(a);
        table.release(a);
        table.release(99);
        assert_eq!(table.live(), 1);
        assert!(table.allocate().is_some());
        assert!(table.allocate().is_none());
    }

    #[test]
    fn vacant_slots_cannot_be_claimed() {
        let table = ConnectionTable::new(1).unwrap();
        assert!(table.claim(0).is_none());
        let idx = table.allocate().unwrap();
        assert!(table.claim(idx).is_some());
        table.release(idx);
        assert!(table.claim(idx).is_none());
    }

    #[test]
    fn claim_is_exclusive_until_dropped() {
        let table = ConnectionTable::new(1).unwrap();
        let idx = table.allocate().unwrap();
        let guard = table.claim(idx).unwrap();
        assert!(table.claim(idx).is_none());
        drop(guard);
        assert!(table.claim(idx).is_some());
    }

    #[test]
    fn concurrent_claims_never_overlap() {
        let table = Arc::new(ConnectionTable::new(4).unwrap());
        for _ in 0..4 {
            table.allocate().unwrap();
        }
        let inside = Arc::new((0..4).map(|_| AtomicUsize::new(0)).collect::<Vec<_>>());
        let overlaps = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let table = Arc::clone(&table);
                let inside = Arc::clone(&inside);
                let overlaps = Arc::clone(&overlaps);
                thread::spawn(move || {
                    for i in 0..2000 {
                        let idx = (t + i) % 4;
                        if let Some(mut conn) = table.claim(idx) {
                            if inside[idx].fetch_add(1, Ordering::SeqCst) != 0 {
                                overlaps.fetch_add(1, Ordering::SeqCst);
                            }
                            conn.reset_request();
                            inside[idx].fetch_sub(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }
}
