// src/slab.rs
use crate::conn::Connection;
use parking_lot::Mutex;
use std::sync::Arc;

const NIL: i32 = -1;
const IN_USE: i32 = -2;

/// Pre-allocated connection table.
///
/// The entries are shared with the worker threads; the free list and the
/// active counter belong to the reactor alone, so they live outside the
/// entries and need no synchronisation.
pub struct ConnectionSlab {
    entries: Arc<[Mutex<Connection>]>,
    // links[i] is the next free index while slot i is free, IN_USE otherwise.
    links: Box<[i32]>,
    head_free: i32,
    active_count: usize,
}

impl ConnectionSlab {
    /// Allocate every slot up front; buffers are never reallocated afterwards.
    pub fn new(capacity: usize) -> Self {
        let entries: Vec<Mutex<Connection>> =
            (0..capacity).map(|_| Mutex::new(Connection::empty())).collect();
        let links: Vec<i32> = (0..capacity)
            .map(|i| if i + 1 == capacity { NIL } else { (i + 1) as i32 })
            .collect();

        Self {
            entries: entries.into(),
            links: links.into_boxed_slice(),
            head_free: if capacity == 0 { NIL } else { 0 },
            active_count: 0,
        }
    }

    /// O(1) allocation. `None` once every slot is taken.
    #[inline(always)]
    pub fn allocate(&mut self) -> Option<usize> {
        if self.head_free == NIL {
            return None;
        }
        let idx = self.head_free as usize;
        self.head_free = self.links[idx];
        self.links[idx] = IN_USE;
        self.active_count += 1;
        Some(idx)
    }

    /// O(1) release. Freeing a slot that is not in use is a no-op.
    #[inline(always)]
    pub fn free(&mut self, index: usize) {
        if !self.is_allocated(index) {
            return;
        }
        self.links[index] = self.head_free;
        self.head_free = index as i32;
        self.active_count -= 1;
    }

    #[inline(always)]
    pub fn is_allocated(&self, index: usize) -> bool {
        self.links.get(index) == Some(&IN_USE)
    }

    #[inline(always)]
    pub fn get(&self, index: usize) -> Option<&Mutex<Connection>> {
        self.entries.get(index)
    }

    /// Shared handle on the entries for the worker threads.
    pub fn entries(&self) -> Arc<[Mutex<Connection>]> {
        Arc::clone(&self.entries)
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.active_count
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.active_count == 0
    }

    #[inline(always)]
    pub fn is_full(&self) -> bool {
        self.head_free == NIL
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::ConnState;

    #[test]
    fn test_slab_operations() {
        let mut slab = ConnectionSlab::new(10);
        assert!(slab.is_empty());
        assert_eq!(slab.capacity(), 10);

        let idx1 = slab.allocate().unwrap();
        assert_eq!(idx1, 0);
        assert!(slab.is_allocated(idx1));
        assert_eq!(slab.get(idx1).unwrap().lock().state(), ConnState::Free);

        let idx2 = slab.allocate().unwrap();
        assert_eq!(idx2, 1);

        slab.free(idx1);
        assert_eq!(slab.len(), 1);
        assert!(!slab.is_allocated(idx1));

        // Freed slots go to the head of the list.
        let idx3 = slab.allocate().unwrap();
        assert_eq!(idx3, 0);
    }

    #[test]
    fn test_exhaustion_and_double_free() {
        let mut slab = ConnectionSlab::new(2);
        let a = slab.allocate().unwrap();
        let b = slab.allocate().unwrap();
        assert!(slab.is_full());
        assert_eq!(slab.allocate(), None);

        slab.free(b);
        slab.free(b);
        slab.free(99);
        assert_eq!(slab.len(), 1);

        assert_eq!(slab.allocate(), Some(b));
        assert_eq!(slab.allocate(), None);
        slab.free(a);
        slab.free(b);
        assert!(slab.is_empty());
    }

    #[test]
    fn test_zero_capacity() {
        let mut slab = ConnectionSlab::new(0);
        assert!(slab.is_full());
        assert_eq!(slab.allocate(), None);
    }

    #[test]
    fn test_entries_are_shared() {
        let slab = ConnectionSlab::new(3);
        let shared = slab.entries();
        assert_eq!(shared.len(), 3);
        assert!(std::ptr::eq(&shared[1], slab.get(1).unwrap()));
    }
}
