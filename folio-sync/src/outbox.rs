//! Outbox for local updates made while the transport is unreachable.
//!
//! Queued updates are published in order once the coordinator reconnects.
//! When the queue is full further updates are not stored individually; the
//! outbox remembers the overflow and the next flush publishes the full
//! document state instead, which subsumes everything that was dropped.

use std::collections::VecDeque;

pub struct OfflineQueue {
    queue: VecDeque<Vec<u8>>,
    max_size: usize,
    overflowed: bool,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
            overflowed: false,
        }
    }

    /// Queue an update. Returns `false` if the queue is full.
    pub fn enqueue(&mut self, update: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            self.overflowed = true;
            return false;
        }
        self.queue.push_back(update);
        true
    }

    /// Put updates back at the front, ahead of anything queued since.
    pub fn requeue_front(&mut self, updates: Vec<Vec<u8>>) {
        for update in updates.into_iter().rev() {
            self.queue.push_front(update);
        }
    }

    /// Take everything queued, plus whether updates were dropped.
    pub fn drain(&mut self) -> (Vec<Vec<u8>>, bool) {
        let overflowed = std::mem::take(&mut self.overflowed);
        (self.queue.drain(..).collect(), overflowed)
    }

    /// Queued updates, oldest first.
    pub fn pending(&self) -> Vec<Vec<u8>> {
        self.queue.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty() && !self.overflowed
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|u| u.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_drain_order() {
        let mut q = OfflineQueue::new(10);
        assert!(q.enqueue(vec![1]));
        assert!(q.enqueue(vec![2, 2]));
        assert_eq!(q.len(), 2);
        assert_eq!(q.total_bytes(), 3);

        let (updates, overflowed) = q.drain();
        assert_eq!(updates, vec![vec![1], vec![2, 2]]);
        assert!(!overflowed);
        assert!(q.is_empty());
    }

    #[test]
    fn test_overflow_is_remembered() {
        let mut q = OfflineQueue::new(2);
        assert!(q.enqueue(vec![1]));
        assert!(q.enqueue(vec![2]));
        assert!(!q.enqueue(vec![3]));
        assert!(q.overflowed());
        assert!(!q.is_empty());

        let (updates, overflowed) = q.drain();
        assert_eq!(updates.len(), 2);
        assert!(overflowed);
        assert!(!q.overflowed());
    }

    #[test]
    fn test_requeue_front() {
        let mut q = OfflineQueue::new(10);
        q.enqueue(vec![3]);
        q.requeue_front(vec![vec![1], vec![2]]);
        assert_eq!(q.pending(), vec![vec![1], vec![2], vec![3]]);
    }
}
