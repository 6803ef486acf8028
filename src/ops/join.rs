//! An inner join of two keyed streams.
//!
//! Both sides travel over one keyed partition, tagged with their side, so every record of a key
//! meets the records of the same key from the other side at one destination.

use std::collections::BTreeMap;
use std::hash::Hash;

use crate::error::Result;
use crate::header::MessageHeader;
use crate::message::Payload;
use crate::operation::ChannelOperation;
use crate::receiver::MessageReceiver;
use crate::routing::selector::DestinationSelector;
use crate::transport::Transport;
use crate::TaskId;

use super::keyed::KeyedPartition;
use super::Markers;

/// Tag of records on the left side.
pub const LEFT: u8 = 0;
/// Tag of records on the right side.
pub const RIGHT: u8 = 1;

/// Records of a join, keyed, with their side.
pub type Tagged<K, V> = (K, (u8, V));

/// Joins the left and right records sent by every source on their keys.
pub struct Join<K, V, X>
where
    K: Hash + Ord + Clone + 'static,
    V: Clone,
    Tagged<K, V>: crate::Data,
    X: Transport,
{
    partition: KeyedPartition<K, (u8, V), X, JoinReceiver<K, V>>,
}

impl<K, V, X> Join<K, V, X>
where
    K: Hash + Ord + Clone + 'static,
    V: Clone,
    Tagged<K, V>: crate::Data,
    X: Transport,
{
    /// A join choosing destinations by the configured partition algorithm.
    pub fn new(operation: ChannelOperation<Tagged<K, V>, X, JoinReceiver<K, V>>) -> Self {
        Join { partition: KeyedPartition::new(operation) }
    }

    /// A join choosing destinations with `selector`, which must send equal keys to one place.
    pub fn with_selector(operation: ChannelOperation<Tagged<K, V>, X, JoinReceiver<K, V>>, selector: Box<dyn DestinationSelector<K>>) -> Self {
        Join { partition: KeyedPartition::with_selector(operation, selector) }
    }

    /// Routes left-side `records` of `source`; `Ok(false)` while its previous batch is staged.
    pub fn partition_left(&mut self, source: TaskId, records: Vec<(K, V)>) -> Result<bool> {
        self.send(source, LEFT, records)
    }

    /// Routes right-side `records` of `source`; `Ok(false)` while its previous batch is staged.
    pub fn partition_right(&mut self, source: TaskId, records: Vec<(K, V)>) -> Result<bool> {
        self.send(source, RIGHT, records)
    }

    fn send(&mut self, source: TaskId, side: u8, records: Vec<(K, V)>) -> Result<bool> {
        let tagged = records.into_iter().map(|(key, value)| (key, (side, value))).collect();
        self.partition.partition(source, tagged, 0)
    }

    /// Ends both sides of the stream of `source`.
    pub fn finish(&mut self, source: TaskId) -> Result<()> { self.partition.finish(source) }
    /// Performs one step; true while work remains.
    pub fn progress(&mut self) -> Result<bool> { self.partition.progress() }
    /// True once every stream ended and nothing is staged or in flight.
    pub fn is_complete(&self) -> bool { self.partition.is_complete() }
    /// Closes the operation.
    pub fn close(&mut self) -> Result<()> { self.partition.close() }
    /// The wrapped keyed partition.
    pub fn partition(&self) -> &KeyedPartition<K, (u8, V), X, JoinReceiver<K, V>> { &self.partition }
    /// The received sides.
    pub fn receiver(&self) -> &JoinReceiver<K, V> { self.partition.receiver() }
}

/// Holds both sides received by each destination, by key.
#[derive(Debug)]
pub struct JoinReceiver<K: Ord, V> {
    left: BTreeMap<TaskId, BTreeMap<K, Vec<V>>>,
    right: BTreeMap<TaskId, BTreeMap<K, Vec<V>>>,
    markers: Markers,
}

impl<K: Ord, V> Default for JoinReceiver<K, V> {
    fn default() -> Self {
        JoinReceiver { left: BTreeMap::new(), right: BTreeMap::new(), markers: Markers::default() }
    }
}

impl<K: Ord + Clone, V: Clone> JoinReceiver<K, V> {
    /// An empty receiver.
    pub fn new() -> Self { Self::default() }

    /// Every pairing of a left and a right value of one key at `target`, in key order.
    ///
    /// Complete once `target` saw the end of every stream.
    pub fn joined(&self, target: TaskId) -> Vec<(K, V, V)> {
        let (left, right) = match (self.left.get(&target), self.right.get(&target)) {
            (Some(left), Some(right)) => (left, right),
            _ => return Vec::new(),
        };
        let mut joined = Vec::new();
        for (key, lefts) in left.iter() {
            if let Some(rights) = right.get(key) {
                for l in lefts.iter() {
                    for r in rights.iter() {
                        joined.push((key.clone(), l.clone(), r.clone()));
                    }
                }
            }
        }
        joined
    }

    /// End-of-stream markers seen by `target`.
    pub fn finished_streams(&self, target: TaskId) -> usize {
        self.markers.finished_streams(target)
    }

    fn absorb(&mut self, source: TaskId, target: TaskId, flags: u32, payload: &Payload<Tagged<K, V>>) {
        self.markers.observe(source, target, flags);
        for (key, (side, value)) in payload.records() {
            let sides = if *side == LEFT { &mut self.left } else { &mut self.right };
            sides.entry(target).or_insert_with(BTreeMap::new)
                .entry(key.clone()).or_insert_with(Vec::new)
                .push(value.clone());
        }
    }
}

impl<K: Ord + Clone, V: Clone> MessageReceiver<Tagged<K, V>> for JoinReceiver<K, V> {
    fn receive_message(&mut self, target: TaskId, header: &MessageHeader, payload: &Payload<Tagged<K, V>>) -> bool {
        self.absorb(header.source as TaskId, target, header.flags, payload);
        true
    }
    fn receive_send_internally(&mut self, source: TaskId, target: TaskId, flags: u32, payload: &Payload<Tagged<K, V>>) -> bool {
        self.absorb(source, target, flags, payload);
        true
    }
    fn sync(&mut self, _source: TaskId, _target: TaskId, _bytes: &[u8]) -> bool {
        self.markers.barrier();
        true
    }
}
