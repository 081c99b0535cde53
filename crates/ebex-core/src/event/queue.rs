use std::fmt;

use crate::event::types::{EventData, EventName, HandlerId, Priority};

/// Anything that can be ordered by the [`PriorityQueue`].
pub trait Prioritized {
    fn priority(&self) -> Priority;
}

/// Binary max-heap keyed by [`Prioritized::priority`].
///
/// Entries with equal priority come out in whatever order the heap
/// structure produces; neither insertion order nor its reverse is kept.
pub struct PriorityQueue<T> {
    items: Vec<T>,
}

impl<T: Prioritized> PriorityQueue<T> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn push(&mut self, item: T) {
        self.items.push(item);
        self.sift_up(self.items.len() - 1);
    }

    /// Remove and return the highest-priority item.
    pub fn pop(&mut self) -> Option<T> {
        if self.items.is_empty() {
            return None;
        }
        let top = self.items.swap_remove(0);
        if !self.items.is_empty() {
            self.sift_down(0);
        }
        Some(top)
    }

    pub fn peek(&self) -> Option<&T> {
        self.items.first()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drop every pending item without looking at it.
    pub fn clear(&mut self) {
        self.items.clear();
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.items[index].priority() <= self.items[parent].priority() {
                break;
            }
            self.items.swap(index, parent);
            index = parent;
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.items.len();
        loop {
            let left = 2 * index + 1;
            let right = left + 1;
            let mut largest = index;

            if left < len && self.items[left].priority() > self.items[largest].priority() {
                largest = left;
            }
            if right < len && self.items[right].priority() > self.items[largest].priority() {
                largest = right;
            }
            if largest == index {
                break;
            }
            self.items.swap(index, largest);
            index = largest;
        }
    }
}

impl<T: Prioritized> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for PriorityQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityQueue")
            .field("len", &self.items.len())
            .finish()
    }
}

/// One (emission, handler) pairing waiting to be dispatched.
///
/// `data` is the handle shared by every entry of the same emission.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub event: EventName,
    pub data: EventData,
    pub handler_id: HandlerId,
    pub priority: Priority,
    pub need_await: bool,
}

impl Prioritized for QueueEntry {
    fn priority(&self) -> Priority {
        self.priority
    }
}
