//! Key/value records routed by key.
//!
//! Each batch handed to [`KeyedPartition::partition`] is split by destination and staged; the
//! parts enter the send queue in order as room becomes available, so a batch is never partially
//! lost to backpressure.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::hash::Hash;

use crate::error::{CommsError, Result};
use crate::header::MessageHeader;
use crate::message::Payload;
use crate::operation::ChannelOperation;
use crate::receiver::MessageReceiver;
use crate::routing::selector::{self, DestinationSelector};
use crate::routing::Destination;
use crate::transport::Transport;
use crate::{Data, TaskId};

use super::{Collective, Markers};

/// Routes `(K, V)` records to the destination a selector picks for `K`.
pub struct KeyedPartition<K, V, X, R>
where
    K: Hash + 'static,
    (K, V): Data,
    X: Transport,
    R: MessageReceiver<(K, V)>,
{
    collective: Collective<(K, V), X, R>,
    selector: Box<dyn DestinationSelector<K>>,
    staged: BTreeMap<TaskId, VecDeque<(TaskId, Vec<(K, V)>, u32)>>,
    // sources whose marker waits for their staged parts.
    finishing: BTreeSet<TaskId>,
}

/// A keyed partition whose destinations group the records they receive by key.
pub type KeyedGather<K, V, X> = KeyedPartition<K, V, X, GroupingReceiver<K, V>>;

/// A keyed gather whose destinations hold their groups in key order.
pub type SortedKeyedGather<K, V, X> = KeyedPartition<K, V, X, SortedGroupingReceiver<K, V>>;

impl<K, V, X, R> KeyedPartition<K, V, X, R>
where
    K: Hash + 'static,
    (K, V): Data,
    X: Transport,
    R: MessageReceiver<(K, V)>,
{
    /// A keyed partition choosing destinations by the configured partition algorithm.
    pub fn new(operation: ChannelOperation<(K, V), X, R>) -> Self {
        let config = operation.config();
        let selector = selector::for_algorithm(config.partition_algorithm, config.ring_virtual_nodes);
        Self::with_selector(operation, selector)
    }

    /// A keyed partition choosing destinations with `selector`.
    pub fn with_selector(operation: ChannelOperation<(K, V), X, R>, mut selector: Box<dyn DestinationSelector<K>>) -> Self {
        let operation = operation.keyed();
        selector.prepare(operation.routing().sources(), operation.routing().destinations());
        KeyedPartition {
            collective: Collective::new(operation),
            selector,
            staged: BTreeMap::new(),
            finishing: BTreeSet::new(),
        }
    }

    /// Routes `records` from `source` by key.
    ///
    /// Returns `Ok(false)` without taking the batch while the previous batch of `source` is
    /// still staged.
    pub fn partition(&mut self, source: TaskId, records: Vec<(K, V)>, flags: u32) -> Result<bool> {
        if self.collective.is_finished(source) || self.finishing.contains(&source) {
            return Err(CommsError::SourceFinished { task: source });
        }
        if self.collective.operation().routing().local_sources().binary_search(&source).is_err() {
            return Err(CommsError::UnknownSource { task: source });
        }
        if self.staged.get(&source).map(|s| !s.is_empty()).unwrap_or(false) {
            return Ok(false);
        }

        let mut parts: BTreeMap<TaskId, Vec<(K, V)>> = BTreeMap::new();
        for record in records {
            let destination = self.selector.next(source, &record.0).ok_or(CommsError::NoDestination { task: source })?;
            parts.entry(destination).or_insert_with(Vec::new).push(record);
        }
        let staged = self.staged.entry(source).or_insert_with(VecDeque::new);
        staged.extend(parts.into_iter().map(|(destination, records)| (destination, records, flags)));
        self.flush(source)?;
        Ok(true)
    }

    /// Moves staged parts of `source` into its send queue while there is room.
    fn flush(&mut self, source: TaskId) -> Result<()> {
        if let Some(staged) = self.staged.get_mut(&source) {
            while !staged.is_empty() && self.collective.operation().can_submit(source) {
                if let Some((destination, records, flags)) = staged.pop_front() {
                    self.collective.submit(source, Destination::Task(destination), Payload::Records(records), flags)?;
                }
            }
            if !staged.is_empty() {
                return Ok(());
            }
        }
        if self.finishing.remove(&source) {
            self.collective.finish(source)?;
        }
        Ok(())
    }

    /// Ends the stream of `source` once its staged parts went out.
    pub fn finish(&mut self, source: TaskId) -> Result<()> {
        if self.collective.operation().routing().local_sources().binary_search(&source).is_err() {
            return Err(CommsError::UnknownSource { task: source });
        }
        if !self.collective.is_finished(source) {
            self.finishing.insert(source);
        }
        self.flush(source)
    }

    /// Performs one step; true while work remains.
    pub fn progress(&mut self) -> Result<bool> {
        let sources: Vec<_> = self.staged.keys().cloned().chain(self.finishing.iter().cloned()).collect();
        for source in sources {
            self.flush(source)?;
        }
        self.collective.progress()?;
        Ok(!self.is_complete())
    }

    /// True once every stream ended and nothing is staged or in flight.
    pub fn is_complete(&self) -> bool {
        self.finishing.is_empty() && self.staged.values().all(|s| s.is_empty()) && self.collective.is_complete()
    }

    /// Closes the operation.
    pub fn close(&mut self) -> Result<()> {
        self.staged.clear();
        self.collective.close()
    }

    /// The wrapped collective.
    pub fn collective(&self) -> &Collective<(K, V), X, R> { &self.collective }
    /// The receiver of delivered records.
    pub fn receiver(&self) -> &R { self.collective.operation().receiver() }
}

/// Groups delivered `(K, V)` records by key, per destination task.
#[derive(Debug)]
pub struct GroupingReceiver<K: Hash + Eq, V> {
    groups: BTreeMap<TaskId, HashMap<K, Vec<V>>>,
    markers: Markers,
}

impl<K: Hash + Eq, V> Default for GroupingReceiver<K, V> {
    fn default() -> Self {
        GroupingReceiver { groups: BTreeMap::new(), markers: Markers::default() }
    }
}

impl<K: Hash + Eq + Clone, V: Clone> GroupingReceiver<K, V> {
    /// An empty receiver.
    pub fn new() -> Self { Self::default() }

    /// The records received by `target`, by key.
    pub fn groups(&self, target: TaskId) -> Option<&HashMap<K, Vec<V>>> {
        self.groups.get(&target)
    }

    /// Removes and returns the records received by `target`.
    pub fn take(&mut self, target: TaskId) -> HashMap<K, Vec<V>> {
        self.groups.remove(&target).unwrap_or_default()
    }

    /// End-of-stream markers seen by `target`.
    pub fn finished_streams(&self, target: TaskId) -> usize {
        self.markers.finished_streams(target)
    }

    /// Synchronisation barriers delivered.
    pub fn barriers(&self) -> usize { self.markers.barriers() }

    fn absorb(&mut self, source: TaskId, target: TaskId, flags: u32, payload: &Payload<(K, V)>) {
        self.markers.observe(source, target, flags);
        let groups = self.groups.entry(target).or_insert_with(HashMap::new);
        for (key, value) in payload.records() {
            groups.entry(key.clone()).or_insert_with(Vec::new).push(value.clone());
        }
    }
}

impl<K: Hash + Eq + Clone, V: Clone> MessageReceiver<(K, V)> for GroupingReceiver<K, V> {
    fn receive_message(&mut self, target: TaskId, header: &MessageHeader, payload: &Payload<(K, V)>) -> bool {
        self.absorb(header.source as TaskId, target, header.flags, payload);
        true
    }
    fn receive_send_internally(&mut self, source: TaskId, target: TaskId, flags: u32, payload: &Payload<(K, V)>) -> bool {
        self.absorb(source, target, flags, payload);
        true
    }
    fn sync(&mut self, _source: TaskId, _target: TaskId, _bytes: &[u8]) -> bool {
        self.markers.barrier();
        true
    }
}

/// Groups delivered `(K, V)` records by key in key order, per destination task.
///
/// Values of a key keep their arrival order.
#[derive(Debug)]
pub struct SortedGroupingReceiver<K: Ord, V> {
    groups: BTreeMap<TaskId, BTreeMap<K, Vec<V>>>,
    markers: Markers,
}

impl<K: Ord, V> Default for SortedGroupingReceiver<K, V> {
    fn default() -> Self {
        SortedGroupingReceiver { groups: BTreeMap::new(), markers: Markers::default() }
    }
}

impl<K: Ord + Clone, V: Clone> SortedGroupingReceiver<K, V> {
    /// An empty receiver.
    pub fn new() -> Self { Self::default() }

    /// The records received by `target`, in ascending key order.
    pub fn groups(&self, target: TaskId) -> Option<&BTreeMap<K, Vec<V>>> {
        self.groups.get(&target)
    }

    /// The groups of `target` ordered by `compare` on keys.
    pub fn sorted_by<C: FnMut(&K, &K) -> Ordering>(&self, target: TaskId, mut compare: C) -> Vec<(&K, &[V])> {
        let mut sorted: Vec<(&K, &[V])> = match self.groups.get(&target) {
            Some(groups) => groups.iter().map(|(key, values)| (key, &values[..])).collect(),
            None => Vec::new(),
        };
        sorted.sort_by(|a, b| compare(a.0, b.0));
        sorted
    }

    /// Removes and returns the records received by `target`.
    pub fn take(&mut self, target: TaskId) -> BTreeMap<K, Vec<V>> {
        self.groups.remove(&target).unwrap_or_default()
    }

    /// End-of-stream markers seen by `target`.
    pub fn finished_streams(&self, target: TaskId) -> usize {
        self.markers.finished_streams(target)
    }

    /// Synchronisation barriers delivered.
    pub fn barriers(&self) -> usize { self.markers.barriers() }

    fn absorb(&mut self, source: TaskId, target: TaskId, flags: u32, payload: &Payload<(K, V)>) {
        self.markers.observe(source, target, flags);
        let groups = self.groups.entry(target).or_insert_with(BTreeMap::new);
        for (key, value) in payload.records() {
            groups.entry(key.clone()).or_insert_with(Vec::new).push(value.clone());
        }
    }
}

impl<K: Ord + Clone, V: Clone> MessageReceiver<(K, V)> for SortedGroupingReceiver<K, V> {
    fn receive_message(&mut self, target: TaskId, header: &MessageHeader, payload: &Payload<(K, V)>) -> bool {
        self.absorb(header.source as TaskId, target, header.flags, payload);
        true
    }
    fn receive_send_internally(&mut self, source: TaskId, target: TaskId, flags: u32, payload: &Payload<(K, V)>) -> bool {
        self.absorb(source, target, flags, payload);
        true
    }
    fn sync(&mut self, _source: TaskId, _target: TaskId, _bytes: &[u8]) -> bool {
        self.markers.barrier();
        true
    }
}
