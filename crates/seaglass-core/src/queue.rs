//! Mutex-guarded work queue.

use parking_lot::Mutex;

/// A queue that many producers push into and one consumer drains.
///
/// Pushing blocks briefly on the lock; items are never dropped.
#[derive(Debug)]
pub struct SyncQueue<T> {
    items: Mutex<Vec<T>>,
}

impl<T> Default for SyncQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SyncQueue<T> {
    /// Create an empty queue.
    pub const fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }

    /// Create a queue with room for `capacity` items.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    /// Append one item.
    pub fn push(&self, item: T) {
        self.items.lock().push(item);
    }

    /// Append many items under a single lock.
    pub fn extend<I: IntoIterator<Item = T>>(&self, items: I) {
        self.items.lock().extend(items);
    }

    /// Take every queued item, in push order.
    pub fn drain(&self) -> Vec<T> {
        std::mem::take(&mut *self.items.lock())
    }

    /// Move every queued item into `out`, keeping `out`'s allocation.
    pub fn drain_into(&self, out: &mut Vec<T>) {
        out.append(&mut self.items.lock());
    }

    /// Drop every queued item.
    pub fn clear(&self) {
        self.items.lock().clear();
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn drain_preserves_push_order() {
        let queue = SyncQueue::new();
        queue.push(1);
        queue.extend([2, 3]);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.drain(), vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn drain_into_appends() {
        let queue = SyncQueue::with_capacity(4);
        queue.extend([5, 6]);
        let mut out = vec![4];
        queue.drain_into(&mut out);
        assert_eq!(out, vec![4, 5, 6]);
    }

    #[test]
    fn concurrent_pushes_are_not_lost() {
        let queue = Arc::new(SyncQueue::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..250 {
                        queue.push(t * 1000 + i);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut items = queue.drain();
        items.sort_unstable();
        items.dedup();
        assert_eq!(items.len(), 1000);
    }
}
