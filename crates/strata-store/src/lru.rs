//! Recency order over memo ids.
//!
//! A slot arena with prev/next indices, keyed by `MemoId`. The head is the
//! least recently used id, the tail the most recent. All operations are
//! O(1) apart from iteration.
//!
//! Each entry also carries the slab's transient `evicting` mark for that
//! memo, so the memo itself stays immutable.

use std::collections::HashMap;

use crate::id::MemoId;

#[derive(Debug)]
struct Slot {
    id: MemoId,
    evicting: bool,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Doubly linked recency list stored in a `Vec`.
#[derive(Debug, Default)]
pub struct LruIndex {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    index: HashMap<MemoId, usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl LruIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert at the most-recent end. Returns false if already present.
    pub fn push(&mut self, id: MemoId) -> bool {
        if self.index.contains_key(&id) {
            return false;
        }
        let slot = Slot {
            id: id.clone(),
            evicting: false,
            prev: None,
            next: None,
        };
        let at = match self.free.pop() {
            Some(at) => {
                self.slots[at] = Some(slot);
                at
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.index.insert(id, at);
        self.link_tail(at);
        true
    }

    /// Move to the most-recent end.
    pub fn touch(&mut self, id: &MemoId) -> bool {
        let Some(&at) = self.index.get(id) else {
            return false;
        };
        if self.tail != Some(at) {
            self.unlink(at);
            self.link_tail(at);
        }
        true
    }

    pub fn remove(&mut self, id: &MemoId) -> bool {
        let Some(at) = self.index.remove(id) else {
            return false;
        };
        self.unlink(at);
        self.slots[at] = None;
        self.free.push(at);
        true
    }

    /// Set the evicting mark. Returns the previous mark, or `None` if absent.
    pub fn set_evicting(&mut self, id: &MemoId, evicting: bool) -> Option<bool> {
        let at = *self.index.get(id)?;
        let slot = self.slot_mut(at)?;
        Some(std::mem::replace(&mut slot.evicting, evicting))
    }

    pub fn is_evicting(&self, id: &MemoId) -> bool {
        self.index
            .get(id)
            .and_then(|&at| self.slot(at))
            .is_some_and(|slot| slot.evicting)
    }

    /// Least recently used first.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            lru: self,
            cursor: self.head,
            forward: true,
        }
    }

    /// Most recently used first.
    pub fn iter_recent(&self) -> Iter<'_> {
        Iter {
            lru: self,
            cursor: self.tail,
            forward: false,
        }
    }

    fn slot(&self, at: usize) -> Option<&Slot> {
        self.slots.get(at).and_then(Option::as_ref)
    }

    fn slot_mut(&mut self, at: usize) -> Option<&mut Slot> {
        self.slots.get_mut(at).and_then(Option::as_mut)
    }

    fn link_tail(&mut self, at: usize) {
        let old_tail = self.tail;
        if let Some(slot) = self.slot_mut(at) {
            slot.prev = old_tail;
            slot.next = None;
        }
        match old_tail.and_then(|t| self.slot_mut(t)) {
            Some(tail) => tail.next = Some(at),
            None => self.head = Some(at),
        }
        self.tail = Some(at);
    }

    fn unlink(&mut self, at: usize) {
        let (prev, next) = match self.slot_mut(at) {
            Some(slot) => (slot.prev.take(), slot.next.take()),
            None => return,
        };
        match prev.and_then(|p| self.slot_mut(p)) {
            Some(p) => p.next = next,
            None => self.head = next,
        }
        match next.and_then(|n| self.slot_mut(n)) {
            Some(n) => n.prev = prev,
            None => self.tail = prev,
        }
    }
}

/// Iterator over ids in recency order.
pub struct Iter<'a> {
    lru: &'a LruIndex,
    cursor: Option<usize>,
    forward: bool,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a MemoId;

    fn next(&mut self) -> Option<Self::Item> {
        let slot = self.lru.slot(self.cursor?)?;
        self.cursor = if self.forward { slot.next } else { slot.prev };
        Some(&slot.id)
    }
}
