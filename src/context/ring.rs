//! Fixed-capacity history that evicts its oldest item

use serde::Serialize;
use std::collections::VecDeque;

#[derive(Debug, Clone, Serialize)]
#[serde(transparent)]
pub struct BoundedRing<T> {
    #[serde(skip)]
    capacity: usize,
    items: VecDeque<T>,
}

impl<T> BoundedRing<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            items: VecDeque::with_capacity(capacity),
        }
    }

    /// Append, dropping the oldest item once full. Returns the evicted item.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() == self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.items.iter()
    }

    pub fn latest(&self) -> Option<&T> {
        self.items.back()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keeps_last_fifty() {
        let mut ring = BoundedRing::new(50);
        for i in 0..60 {
            ring.push(i);
        }
        assert_eq!(ring.len(), 50);
        assert_eq!(ring.iter().next(), Some(&10));
        assert_eq!(ring.latest(), Some(&59));
    }

    #[test]
    fn test_push_reports_eviction() {
        let mut ring = BoundedRing::new(2);
        assert_eq!(ring.push("a"), None);
        assert_eq!(ring.push("b"), None);
        assert_eq!(ring.push("c"), Some("a"));
        assert_eq!(ring.iter().rev().copied().collect::<Vec<_>>(), vec!["c", "b"]);
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let mut ring = BoundedRing::new(0);
        ring.push(1);
        ring.push(2);
        assert_eq!(ring.capacity(), 1);
        assert_eq!(ring.latest(), Some(&2));
    }
}
