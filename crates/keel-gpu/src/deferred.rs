//! Deferred destruction for resources still referenced by in-flight work.
//!
//! A resource cannot be destroyed while a submitted command buffer still uses
//! it. Callers tag each retired item with the submission epoch that last
//! referenced it and report completed epochs as their fences signal.

use std::collections::VecDeque;

/// An item waiting for its epoch to complete.
#[derive(Debug)]
struct Retired<T> {
    item: T,
    epoch: u64,
}

/// FIFO of items released once their submission epoch has completed.
#[derive(Debug)]
pub struct RetireQueue<T> {
    pending: VecDeque<Retired<T>>,
}

impl<T> Default for RetireQueue<T> {
    fn default() -> Self {
        Self {
            pending: VecDeque::new(),
        }
    }
}

impl<T> RetireQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `item` until `epoch` completes.
    ///
    /// Epochs are clamped to be non-decreasing, so an item queued with an
    /// older epoch than its predecessor waits for the predecessor's epoch.
    pub fn retire(&mut self, item: T, epoch: u64) {
        let epoch = self
            .pending
            .back()
            .map_or(epoch, |last| last.epoch.max(epoch));
        self.pending.push_back(Retired { item, epoch });
    }

    /// Remove every item whose epoch is at or below `completed_epoch`, oldest
    /// first.
    pub fn release_completed(&mut self, completed_epoch: u64) -> Vec<T> {
        let mut released = Vec::new();
        // Epochs are non-decreasing, so only the front can mature.
        while self
            .pending
            .front()
            .is_some_and(|retired| retired.epoch <= completed_epoch)
        {
            if let Some(retired) = self.pending.pop_front() {
                released.push(retired.item);
            }
        }
        released
    }

    /// Remove everything regardless of epoch. Only call once the device is
    /// idle.
    pub fn drain(&mut self) -> Vec<T> {
        self.pending.drain(..).map(|retired| retired.item).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn items_wait_for_their_epoch() {
        let mut queue = RetireQueue::new();
        queue.retire("a", 1);
        queue.retire("b", 2);
        queue.retire("c", 4);

        assert!(queue.release_completed(0).is_empty());
        assert_eq!(queue.release_completed(2), ["a", "b"]);
        assert_eq!(queue.pending_count(), 1);
        assert!(queue.release_completed(3).is_empty());
        assert_eq!(queue.release_completed(10), ["c"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn older_epochs_wait_behind_newer_ones() {
        let mut queue = RetireQueue::new();
        queue.retire(1, 5);
        queue.retire(2, 3);

        assert!(queue.release_completed(4).is_empty());
        assert_eq!(queue.release_completed(5), [1, 2]);
    }

    #[test]
    fn drain_releases_everything_in_order() {
        let mut queue = RetireQueue::new();
        queue.retire('x', 7);
        queue.retire('y', 9);

        assert_eq!(queue.drain(), ['x', 'y']);
        assert_eq!(queue.pending_count(), 0);
    }
}
