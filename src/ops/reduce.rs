//! Values of every source combined by a user function.
//!
//! Each call to [`Reduce::reduce`] contributes one value of its source to the next round. A
//! destination completes a round once every source contributed to it or ended its stream, and
//! folds the contributions in source order. Sources that finished early drop out of later rounds.

use std::collections::{BTreeMap, VecDeque};

use crate::error::{CommsError, Result};
use crate::header::MessageHeader;
use crate::message::Payload;
use crate::operation::ChannelOperation;
use crate::receiver::MessageReceiver;
use crate::routing::Destination;
use crate::transport::Transport;
use crate::{Data, TaskId};

use super::{Collective, Markers};

/// Reduces the contributions of every source, round by round, at each destination.
pub struct ReduceReceiver<T, F: FnMut(T, T) -> T> {
    function: F,
    sources: Vec<TaskId>,
    // contributions not yet reduced, per target and source.
    pending: BTreeMap<TaskId, BTreeMap<TaskId, VecDeque<T>>>,
    rounds: BTreeMap<TaskId, Vec<T>>,
    markers: Markers,
}

impl<T: Clone, F: FnMut(T, T) -> T> ReduceReceiver<T, F> {
    /// A receiver combining values with `function`.
    pub fn new(function: F) -> Self {
        ReduceReceiver {
            function,
            sources: Vec::new(),
            pending: BTreeMap::new(),
            rounds: BTreeMap::new(),
            markers: Markers::default(),
        }
    }

    /// Sets the sources contributing to every round.
    pub fn expect_sources(&mut self, sources: &[TaskId]) {
        self.sources = sources.to_vec();
    }

    /// The reduced rounds of `target` so far.
    pub fn rounds(&self, target: TaskId) -> &[T] {
        self.rounds.get(&target).map(|r| &r[..]).unwrap_or(&[])
    }

    /// Removes and returns the reduced rounds of `target`.
    pub fn take_rounds(&mut self, target: TaskId) -> Vec<T> {
        self.rounds.remove(&target).unwrap_or_default()
    }

    /// End-of-stream markers seen by `target`.
    pub fn finished_streams(&self, target: TaskId) -> usize {
        self.markers.finished_streams(target)
    }

    /// Synchronisation barriers delivered.
    pub fn barriers(&self) -> usize { self.markers.barriers() }

    fn absorb(&mut self, source: TaskId, target: TaskId, flags: u32, payload: &Payload<T>) {
        let ReduceReceiver { function, sources, pending, rounds, markers } = self;
        let queues = pending.entry(target).or_insert_with(BTreeMap::new);

        // a message carrying several records contributes their reduction.
        let contribution = payload.records().iter().cloned().fold(None, |acc, value| match acc {
            Some(acc) => Some(function(acc, value)),
            None => Some(value),
        });
        if let Some(value) = contribution {
            queues.entry(source).or_insert_with(VecDeque::new).push_back(value);
        }
        markers.observe(source, target, flags);

        loop {
            let queued = |s: &TaskId| queues.get(s).map(|q| !q.is_empty()).unwrap_or(false);
            let complete = sources.iter().all(|s| queued(s) || markers.has_finished(target, *s));
            if !complete || !sources.iter().any(|s| queued(s)) {
                break;
            }
            let mut reduced = None;
            for source in sources.iter() {
                if let Some(value) = queues.get_mut(source).and_then(|q| q.pop_front()) {
                    reduced = Some(match reduced {
                        Some(acc) => function(acc, value),
                        None => value,
                    });
                }
            }
            if let Some(value) = reduced {
                rounds.entry(target).or_insert_with(Vec::new).push(value);
            }
        }
    }
}

impl<T: Clone, F: FnMut(T, T) -> T> MessageReceiver<T> for ReduceReceiver<T, F> {
    fn receive_message(&mut self, target: TaskId, header: &MessageHeader, payload: &Payload<T>) -> bool {
        self.absorb(header.source as TaskId, target, header.flags, payload);
        true
    }
    fn receive_send_internally(&mut self, source: TaskId, target: TaskId, flags: u32, payload: &Payload<T>) -> bool {
        self.absorb(source, target, flags, payload);
        true
    }
    fn sync(&mut self, _source: TaskId, _target: TaskId, _bytes: &[u8]) -> bool {
        self.markers.barrier();
        true
    }
}

/// A reduce at one destination, or an all-reduce at every destination.
pub struct Reduce<T: Data, X: Transport, F: FnMut(T, T) -> T> {
    collective: Collective<T, X, ReduceReceiver<T, F>>,
    destination: Destination,
}

impl<T: Data, X: Transport, F: FnMut(T, T) -> T> Reduce<T, X, F> {
    /// Reduces at `target`, which must be a destination of `operation`.
    pub fn to(operation: ChannelOperation<T, X, ReduceReceiver<T, F>>, target: TaskId) -> Result<Self> {
        if operation.routing().destinations().binary_search(&target).is_err() {
            return Err(CommsError::UnknownDestination { task: target });
        }
        Ok(Self::wrap(operation, Destination::Task(target)))
    }

    /// Reduces at every destination of `operation`.
    pub fn all(operation: ChannelOperation<T, X, ReduceReceiver<T, F>>) -> Self {
        Self::wrap(operation, Destination::All)
    }

    fn wrap(mut operation: ChannelOperation<T, X, ReduceReceiver<T, F>>, destination: Destination) -> Self {
        let sources = operation.routing().sources().to_vec();
        operation.receiver_mut().expect_sources(&sources);
        Reduce { collective: Collective::new(operation), destination }
    }

    /// Contributes `value` of `source` to its next round.
    pub fn reduce(&mut self, source: TaskId, value: T) -> Result<bool> {
        self.collective.submit(source, self.destination, Payload::Single(value), 0)
    }

    /// Ends the stream of `source`.
    pub fn finish(&mut self, source: TaskId) -> Result<()> { self.collective.finish(source) }
    /// Performs one step; true while work remains.
    pub fn progress(&mut self) -> Result<bool> { self.collective.progress() }
    /// True once every stream ended and nothing is in flight.
    pub fn is_complete(&self) -> bool { self.collective.is_complete() }
    /// Closes the operation.
    pub fn close(&mut self) -> Result<()> { self.collective.close() }
    /// The wrapped collective.
    pub fn collective(&self) -> &Collective<T, X, ReduceReceiver<T, F>> { &self.collective }
    /// The reduced rounds.
    pub fn receiver(&self) -> &ReduceReceiver<T, F> { self.collective.operation().receiver() }
}
