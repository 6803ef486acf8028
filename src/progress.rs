//! Round-robin choice among ids with work.

use std::collections::VecDeque;

/// Hands out ids in rotation so that no source or destination starves.
///
/// An id taken with [`next`](ProgressTracker::next) is unavailable until it is returned with
/// [`finish`](ProgressTracker::finish), which places it at the back of the rotation.
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    queue: VecDeque<usize>,
}

impl ProgressTracker {
    /// A tracker rotating through `ids`.
    pub fn new<I: IntoIterator<Item=usize>>(ids: I) -> Self {
        ProgressTracker { queue: ids.into_iter().collect() }
    }

    /// True if some id is available.
    pub fn can_progress(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Takes the next id.
    pub fn next(&mut self) -> Option<usize> {
        self.queue.pop_front()
    }

    /// Returns `id` to the rotation.
    pub fn finish(&mut self, id: usize) {
        self.queue.push_back(id);
    }
}

#[cfg(test)]
mod tests {
    use super::ProgressTracker;

    #[test]
    fn rotates_fairly() {
        let mut tracker = ProgressTracker::new(vec![4, 1, 9]);
        let mut order = Vec::new();
        for _ in 0..6 {
            let id = tracker.next().unwrap();
            order.push(id);
            tracker.finish(id);
        }
        assert_eq!(order, vec![4, 1, 9, 4, 1, 9]);
    }

    #[test]
    fn taken_ids_are_unavailable() {
        let mut tracker = ProgressTracker::new(Some(3));
        assert_eq!(tracker.next(), Some(3));
        assert!(!tracker.can_progress());
        assert_eq!(tracker.next(), None);
        tracker.finish(3);
        assert!(tracker.can_progress());
    }
}
