//! Intrusive heap lists
//!
//! The allocated, finalize and refzero lists are doubly linked through the
//! `next`/`prev` slot links in each [`HeapHeader`]. All link surgery lives in
//! this module; a header records which list it is on, so a header can never
//! be linked into two lists at once.

use crate::header::{HeapHeader, NIL};

/// Identity of a heap list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListKind {
    /// Live objects and buffers
    Allocated,
    /// Objects waiting for their finalizer to run
    Finalize,
    /// Objects whose refcount dropped to zero, pending free
    Refzero,
}

/// Doubly linked list of header slots
#[derive(Debug, Clone)]
pub struct HeapList {
    kind: ListKind,
    head: u32,
    tail: u32,
    len: usize,
}

impl HeapList {
    /// Create an empty list
    pub const fn new(kind: ListKind) -> Self {
        Self {
            kind,
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    /// List identity
    pub fn kind(&self) -> ListKind {
        self.kind
    }

    /// Number of linked headers
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if nothing is linked
    pub fn is_empty(&self) -> bool {
        self.head == NIL
    }

    /// First slot, if any
    pub fn head(&self) -> Option<u32> {
        (self.head != NIL).then_some(self.head)
    }

    /// Link `slot` at the head
    pub fn push_front(&mut self, hdrs: &mut [HeapHeader], slot: u32) {
        debug_assert!(hdrs[slot as usize].list.is_none(), "header already on a list");
        let old_head = self.head;
        {
            let h = &mut hdrs[slot as usize];
            h.prev = NIL;
            h.next = old_head;
            h.list = Some(self.kind);
        }
        if old_head != NIL {
            hdrs[old_head as usize].prev = slot;
        } else {
            self.tail = slot;
        }
        self.head = slot;
        self.len += 1;
    }

    /// Link `slot` at the tail
    pub fn push_back(&mut self, hdrs: &mut [HeapHeader], slot: u32) {
        debug_assert!(hdrs[slot as usize].list.is_none(), "header already on a list");
        let old_tail = self.tail;
        {
            let h = &mut hdrs[slot as usize];
            h.next = NIL;
            h.prev = old_tail;
            h.list = Some(self.kind);
        }
        if old_tail != NIL {
            hdrs[old_tail as usize].next = slot;
        } else {
            self.head = slot;
        }
        self.tail = slot;
        self.len += 1;
    }

    /// Unlink `slot`; it must be on this list
    pub fn remove(&mut self, hdrs: &mut [HeapHeader], slot: u32) {
        debug_assert_eq!(hdrs[slot as usize].list, Some(self.kind));
        let (prev, next) = {
            let h = &hdrs[slot as usize];
            (h.prev, h.next)
        };
        if prev != NIL {
            hdrs[prev as usize].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            hdrs[next as usize].prev = prev;
        } else {
            self.tail = prev;
        }
        let h = &mut hdrs[slot as usize];
        h.next = NIL;
        h.prev = NIL;
        h.list = None;
        self.len -= 1;
    }

    /// Unlink and return the head slot
    pub fn pop_front(&mut self, hdrs: &mut [HeapHeader]) -> Option<u32> {
        let slot = self.head()?;
        self.remove(hdrs, slot);
        Some(slot)
    }

    /// Iterate slots head to tail
    pub fn iter<'a>(&self, hdrs: &'a [HeapHeader]) -> ListIter<'a> {
        ListIter {
            hdrs,
            cur: self.head,
        }
    }

    /// Snapshot of the current slots, for loops that relink while walking
    pub fn slots(&self, hdrs: &[HeapHeader]) -> Vec<u32> {
        self.iter(hdrs).collect()
    }
}

/// Iterator over list slots
pub struct ListIter<'a> {
    hdrs: &'a [HeapHeader],
    cur: u32,
}

impl Iterator for ListIter<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.cur == NIL {
            return None;
        }
        let slot = self.cur;
        self.cur = self.hdrs[slot as usize].next;
        Some(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::HeapType;

    fn headers(n: usize) -> Vec<HeapHeader> {
        (0..n).map(|_| HeapHeader::new(HeapType::Object, 0, 0)).collect()
    }

    #[test]
    fn test_push_and_iter() {
        let mut hdrs = headers(4);
        let mut list = HeapList::new(ListKind::Allocated);
        list.push_back(&mut hdrs, 0);
        list.push_back(&mut hdrs, 1);
        list.push_front(&mut hdrs, 2);
        assert_eq!(list.slots(&hdrs), vec![2, 0, 1]);
        assert_eq!(list.len(), 3);
        assert_eq!(hdrs[1].list(), Some(ListKind::Allocated));
        assert_eq!(hdrs[3].list(), None);
    }

    #[test]
    fn test_remove_middle_and_ends() {
        let mut hdrs = headers(3);
        let mut list = HeapList::new(ListKind::Refzero);
        for i in 0..3 {
            list.push_back(&mut hdrs, i);
        }
        list.remove(&mut hdrs, 1);
        assert_eq!(list.slots(&hdrs), vec![0, 2]);
        list.remove(&mut hdrs, 0);
        list.remove(&mut hdrs, 2);
        assert!(list.is_empty());
        assert_eq!(hdrs[2].list(), None);

        list.push_back(&mut hdrs, 2);
        assert_eq!(list.pop_front(&mut hdrs), Some(2));
        assert_eq!(list.pop_front(&mut hdrs), None);
    }

    #[test]
    fn test_move_between_lists() {
        let mut hdrs = headers(2);
        let mut a = HeapList::new(ListKind::Allocated);
        let mut f = HeapList::new(ListKind::Finalize);
        a.push_back(&mut hdrs, 0);
        a.push_back(&mut hdrs, 1);
        a.remove(&mut hdrs, 0);
        f.push_back(&mut hdrs, 0);
        assert_eq!(a.slots(&hdrs), vec![1]);
        assert_eq!(f.slots(&hdrs), vec![0]);
        assert_eq!(hdrs[0].list(), Some(ListKind::Finalize));
    }
}
