//! A four-ary min-heap for timer deadlines.
//!
//! The heap is keyed by `(deadline, sequence)`. The sequence number is assigned by the loop every
//! time a timer is started or restarted, so two timers due at the very same instant fire in the
//! order they were started. A position map from the owning handle allows stopping a timer in the
//! middle of the heap without a linear scan.

use std::collections::HashMap;
use std::time::Instant;

use crate::Handle;

/// One scheduled deadline.
#[derive(Debug, Clone, Copy)]
pub struct TimerEntry {
    pub when: Instant,
    pub seq: u64,
    pub handle: Handle,
}

impl TimerEntry {
    fn key(&self) -> (Instant, u64) {
        (self.when, self.seq)
    }
}

/// The heap itself. Four children per node; with the flat layout the children of node `i` live at
/// `4 * i + 1 ..= 4 * i + 4`.
pub struct TimerHeap {
    entries: Vec<TimerEntry>,
    pos: HashMap<Handle, usize>,
}

const ARITY: usize = 4;

impl TimerHeap {
    pub fn new() -> Self {
        TimerHeap {
            entries: Vec::new(),
            pos: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The entry with the nearest deadline, if any.
    pub fn peek(&self) -> Option<&TimerEntry> {
        self.entries.first()
    }

    /// Insert a new deadline. Each handle can have at most one entry in the heap.
    pub fn push(&mut self, entry: TimerEntry) {
        assert!(
            !self.pos.contains_key(&entry.handle),
            "timer already scheduled"
        );
        let idx = self.entries.len();
        self.pos.insert(entry.handle, idx);
        self.entries.push(entry);
        self.sift_up(idx);
    }

    /// Remove and return the nearest deadline.
    pub fn pop(&mut self) -> Option<TimerEntry> {
        if self.entries.is_empty() {
            return None;
        }
        Some(self.remove_at(0))
    }

    /// Remove the entry belonging to the given handle, if it is scheduled.
    pub fn remove(&mut self, handle: Handle) -> bool {
        match self.pos.get(&handle).copied() {
            Some(idx) => {
                self.remove_at(idx);
                true
            },
            None => false,
        }
    }

    /// Is this handle currently scheduled?
    pub fn contains(&self, handle: Handle) -> bool {
        self.pos.contains_key(&handle)
    }

    fn remove_at(&mut self, idx: usize) -> TimerEntry {
        let last = self.entries.len() - 1;
        self.entries.swap(idx, last);
        let removed = self.entries.pop().unwrap();
        self.pos.remove(&removed.handle);
        if idx <= last && idx < self.entries.len() {
            self.pos.insert(self.entries[idx].handle, idx);
            // The swapped-in entry may need to travel either way
            self.sift_down(idx);
            self.sift_up(idx);
        }
        removed
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / ARITY;
            if self.entries[idx].key() < self.entries[parent].key() {
                self.swap(idx, parent);
                idx = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        loop {
            let first_child = ARITY * idx + 1;
            if first_child >= self.entries.len() {
                break;
            }
            let last_child = (first_child + ARITY).min(self.entries.len());
            let mut smallest = idx;
            for child in first_child..last_child {
                if self.entries[child].key() < self.entries[smallest].key() {
                    smallest = child;
                }
            }
            if smallest == idx {
                break;
            }
            self.swap(idx, smallest);
            idx = smallest;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.entries.swap(a, b);
        self.pos.insert(self.entries[a].handle, a);
        self.pos.insert(self.entries[b].handle, b);
    }
}
