//! Choosing a destination task for each record.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};

use crate::config::PartitionAlgorithm;
use crate::TaskId;

/// Picks the destination of a record sent by a source.
///
/// A prepared selector must send equal keys to the same destination for as long as it lives.
pub trait DestinationSelector<K> {
    /// Installs the tasks of the operation.
    fn prepare(&mut self, sources: &[TaskId], destinations: &[TaskId]);
    /// The destination of `key` sent by `source`, `None` before preparation.
    fn next(&mut self, source: TaskId, key: &K) -> Option<TaskId>;
}

impl<K, S: DestinationSelector<K> + ?Sized> DestinationSelector<K> for Box<S> {
    fn prepare(&mut self, sources: &[TaskId], destinations: &[TaskId]) {
        (**self).prepare(sources, destinations)
    }
    fn next(&mut self, source: TaskId, key: &K) -> Option<TaskId> {
        (**self).next(source, key)
    }
}

/// The selector for a configured partition algorithm.
pub fn for_algorithm<K: Hash + 'static>(algorithm: PartitionAlgorithm, virtual_nodes: usize) -> Box<dyn DestinationSelector<K>> {
    match algorithm {
        PartitionAlgorithm::Simple => Box::new(HashSelector::default()),
        PartitionAlgorithm::Ring => Box::new(RingSelector::new(virtual_nodes)),
    }
}

fn hash_of<K: Hash + ?Sized>(key: &K) -> u64 {
    let mut h = DefaultHasher::new();
    key.hash(&mut h);
    h.finish()
}

/// Hashes the key modulo the number of destinations.
#[derive(Debug, Default, Clone)]
pub struct HashSelector {
    destinations: Vec<TaskId>,
}

impl<K: Hash> DestinationSelector<K> for HashSelector {
    fn prepare(&mut self, _sources: &[TaskId], destinations: &[TaskId]) {
        self.destinations = destinations.to_vec();
        self.destinations.sort();
        self.destinations.dedup();
    }
    fn next(&mut self, _source: TaskId, key: &K) -> Option<TaskId> {
        if self.destinations.is_empty() {
            return None;
        }
        let index = (hash_of(key) % self.destinations.len() as u64) as usize;
        Some(self.destinations[index])
    }
}

/// Cycles through the destinations, independently for each source.
///
/// Keys are ignored, so this selector spreads load but does not group keys.
#[derive(Debug, Default, Clone)]
pub struct RoundRobinSelector {
    destinations: Vec<TaskId>,
    cursors: HashMap<TaskId, usize>,
}

impl<K> DestinationSelector<K> for RoundRobinSelector {
    fn prepare(&mut self, sources: &[TaskId], destinations: &[TaskId]) {
        self.destinations = destinations.to_vec();
        self.destinations.sort();
        self.cursors = sources.iter().map(|s| (*s, 0)).collect();
    }
    fn next(&mut self, source: TaskId, _key: &K) -> Option<TaskId> {
        if self.destinations.is_empty() {
            return None;
        }
        let cursor = self.cursors.entry(source).or_insert(0);
        let target = self.destinations[*cursor % self.destinations.len()];
        *cursor = (*cursor + 1) % self.destinations.len();
        Some(target)
    }
}

/// Consistent hashing over a ring of virtual nodes.
///
/// Each destination owns `virtual_nodes` points of the ring; a key belongs to the first point
/// at or after its hash. Spreads skewed key distributions better than a plain modulus.
#[derive(Debug, Clone)]
pub struct RingSelector {
    virtual_nodes: usize,
    ring: BTreeMap<u64, TaskId>,
}

impl RingSelector {
    /// A ring with `virtual_nodes` points per destination.
    pub fn new(virtual_nodes: usize) -> Self {
        RingSelector { virtual_nodes: virtual_nodes.max(1), ring: BTreeMap::new() }
    }
}

impl<K: Hash> DestinationSelector<K> for RingSelector {
    fn prepare(&mut self, _sources: &[TaskId], destinations: &[TaskId]) {
        self.ring.clear();
        for &destination in destinations {
            for replica in 0 .. self.virtual_nodes {
                self.ring.insert(hash_of(&(destination, replica)), destination);
            }
        }
    }
    fn next(&mut self, _source: TaskId, key: &K) -> Option<TaskId> {
        let point = hash_of(key);
        self.ring.range(point..).next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, task)| *task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_selector_is_stable() {
        let mut selector = HashSelector::default();
        DestinationSelector::<String>::prepare(&mut selector, &[0, 1], &[7, 3, 5]);
        let key = "apple".to_string();
        let first = selector.next(0, &key).unwrap();
        for source in 0..2 {
            for _ in 0..10 {
                assert_eq!(selector.next(source, &key), Some(first));
            }
        }
        assert!([3, 5, 7].contains(&first));
    }

    #[test]
    fn round_robin_per_source() {
        let mut selector = RoundRobinSelector::default();
        DestinationSelector::<u64>::prepare(&mut selector, &[0, 1], &[4, 5]);
        let picks: Vec<_> = (0..3).map(|k| selector.next(0, &k).unwrap()).collect();
        assert_eq!(picks, vec![4, 5, 4]);
        assert_eq!(selector.next(1, &0u64), Some(4));
    }

    #[test]
    fn ring_covers_every_destination() {
        let mut selector = RingSelector::new(32);
        DestinationSelector::<u64>::prepare(&mut selector, &[0], &[1, 2, 3]);
        let mut seen = std::collections::BTreeSet::new();
        for key in 0..1000u64 {
            let target = selector.next(0, &key).unwrap();
            assert_eq!(selector.next(0, &key), Some(target));
            seen.insert(target);
        }
        assert_eq!(seen.into_iter().collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn unprepared_selectors_choose_nothing() {
        let mut selector = RingSelector::new(4);
        assert_eq!(DestinationSelector::<u64>::next(&mut selector, 0, &1), None);
    }
}
