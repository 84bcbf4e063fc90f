//! Priority queue of request ids: higher priority first, FIFO within a tier.

use std::collections::VecDeque;

use crate::entities::{Priority, RequestId};

#[derive(Debug, Default)]
pub struct RequestQueue {
    items: VecDeque<(RequestId, Priority)>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert behind every queued item of equal or higher priority.
    /// Returns the position taken.
    pub fn push(&mut self, id: RequestId, priority: Priority) -> usize {
        let pos = self
            .items
            .iter()
            .position(|(_, p)| *p < priority)
            .unwrap_or(self.items.len());
        self.items.insert(pos, (id, priority));
        pos
    }

    pub fn pop(&mut self) -> Option<RequestId> {
        self.items.pop_front().map(|(id, _)| id)
    }

    pub fn remove(&mut self, id: RequestId) -> bool {
        match self.position(id) {
            Some(pos) => {
                self.items.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn position(&self, id: RequestId) -> Option<usize> {
        self.items.iter().position(|(i, _)| *i == id)
    }

    /// Remove every item matching `filter` (all items for `None`).
    pub fn drain_priority(&mut self, filter: Option<Priority>) -> Vec<RequestId> {
        let (drained, kept): (Vec<_>, Vec<_>) = self
            .items
            .drain(..)
            .partition(|(_, p)| filter.is_none_or(|f| f == *p));
        self.items = kept.into();
        drained.into_iter().map(|(id, _)| id).collect()
    }

    pub fn ids(&self) -> Vec<RequestId> {
        self.items.iter().map(|(id, _)| *id).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_priority_then_fifo() {
        let mut q = RequestQueue::new();
        let low = Uuid::new_v4();
        let crit = Uuid::new_v4();
        let norm1 = Uuid::new_v4();
        let norm2 = Uuid::new_v4();

        q.push(low, Priority::Low);
        q.push(crit, Priority::Critical);
        q.push(norm1, Priority::Normal);
        assert_eq!(q.push(norm2, Priority::Normal), 2);

        assert_eq!(q.ids(), vec![crit, norm1, norm2, low]);
        assert_eq!(q.pop(), Some(crit));
        assert_eq!(q.position(low), Some(2));
    }

    #[test]
    fn test_remove_and_drain() {
        let mut q = RequestQueue::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        q.push(a, Priority::High);
        q.push(b, Priority::Low);
        q.push(c, Priority::Low);

        assert!(q.remove(a));
        assert!(!q.remove(a));
        assert_eq!(q.drain_priority(Some(Priority::High)), Vec::<RequestId>::new());
        assert_eq!(q.drain_priority(Some(Priority::Low)), vec![b, c]);
        assert!(q.is_empty());
    }
}
