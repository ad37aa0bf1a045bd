//! Doubly linked lists threaded through a fixed pool by index.
//!
//! The nodes live in the pool entries themselves; a list only remembers the
//! head and tail indices. Every method takes an accessor from index to the
//! entry's [`Link`]. The links of an entry must only be touched under the lock
//! that protects the list the entry is queued on.

use core::sync::atomic::{AtomicBool, AtomicU16, Ordering};

/// End-of-list marker.
pub const NIL: u16 = u16::MAX;

/// The link embedded in a pool entry.
#[derive(Debug)]
pub struct Link {
    next: AtomicU16,
    prev: AtomicU16,
    queued: AtomicBool,
}

impl Link {
    /// An unlinked node.
    pub const fn new() -> Self {
        Self {
            next: AtomicU16::new(NIL),
            prev: AtomicU16::new(NIL),
            queued: AtomicBool::new(false),
        }
    }

    /// Whether the node is on a list.
    #[inline]
    pub fn is_queued(&self) -> bool {
        self.queued.load(Ordering::Acquire)
    }

    fn next(&self) -> u16 {
        self.next.load(Ordering::Relaxed)
    }

    fn prev(&self) -> u16 {
        self.prev.load(Ordering::Relaxed)
    }

    fn set(&self, prev: u16, next: u16) {
        self.prev.store(prev, Ordering::Relaxed);
        self.next.store(next, Ordering::Relaxed);
    }
}

impl Default for Link {
    fn default() -> Self {
        Self::new()
    }
}

/// Head and tail of a list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexList {
    head: u16,
    tail: u16,
}

impl IndexList {
    /// An empty list.
    pub const fn new() -> Self {
        Self { head: NIL, tail: NIL }
    }

    /// Whether the list is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == NIL
    }

    /// Append `idx`. Returns false if it is already queued.
    pub fn push_back<'a>(&mut self, idx: u16, link: impl Fn(u16) -> &'a Link) -> bool {
        let node = link(idx);
        if node.queued.swap(true, Ordering::AcqRel) {
            return false;
        }
        node.set(self.tail, NIL);
        match self.tail {
            NIL => self.head = idx,
            tail => link(tail).next.store(idx, Ordering::Relaxed),
        }
        self.tail = idx;
        true
    }

    /// Detach and return the first index.
    pub fn pop_front<'a>(&mut self, link: impl Fn(u16) -> &'a Link) -> Option<u16> {
        let idx = self.head;
        if idx == NIL {
            return None;
        }
        self.remove(idx, link);
        Some(idx)
    }

    /// Detach `idx`. Returns false if it was not queued.
    pub fn remove<'a>(&mut self, idx: u16, link: impl Fn(u16) -> &'a Link) -> bool {
        let node = link(idx);
        if !node.queued.swap(false, Ordering::AcqRel) {
            return false;
        }
        let (prev, next) = (node.prev(), node.next());
        match prev {
            NIL => self.head = next,
            p => link(p).next.store(next, Ordering::Relaxed),
        }
        match next {
            NIL => self.tail = prev,
            n => link(n).prev.store(prev, Ordering::Relaxed),
        }
        node.set(NIL, NIL);
        true
    }

    /// Indices from head to tail.
    pub fn iter<'a, F: Fn(u16) -> &'a Link>(&self, link: F) -> impl Iterator<Item = u16> + 'a
    where
        F: 'a,
    {
        let mut cur = self.head;
        core::iter::from_fn(move || {
            let idx = cur;
            if idx == NIL {
                return None;
            }
            cur = link(idx).next();
            Some(idx)
        })
    }
}

impl Default for IndexList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn fifo_order_and_removal() {
        let pool: Vec<Link> = (0..8).map(|_| Link::new()).collect();
        let at = |i: u16| &pool[i as usize];
        let mut list = IndexList::new();
        for i in [3, 1, 6, 2] {
            assert!(list.push_back(i, at));
        }
        assert!(!list.push_back(6, at));
        assert_eq!(list.iter(at).collect::<Vec<_>>(), [3, 1, 6, 2]);

        assert!(list.remove(6, at));
        assert!(!list.remove(6, at));
        assert!(!pool[6].is_queued());
        assert_eq!(list.iter(at).collect::<Vec<_>>(), [3, 1, 2]);

        assert!(list.remove(2, at));
        assert!(list.push_back(5, at));
        assert_eq!(list.pop_front(at), Some(3));
        assert_eq!(list.pop_front(at), Some(1));
        assert_eq!(list.pop_front(at), Some(5));
        assert_eq!(list.pop_front(at), None);
        assert!(list.is_empty());
    }
}
