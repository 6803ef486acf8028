//! Collective operations over one channel operation each.
//!
//! A collective adds end-of-stream handling to a [`ChannelOperation`]: every local source calls
//! `finish` once it has nothing more to send, which queues a `LAST` marker to every destination.
//! The collective is complete once its own markers went out and every source's marker arrived.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{CommsError, Result};
use crate::header::flags;
use crate::message::Payload;
use crate::operation::ChannelOperation;
use crate::receiver::MessageReceiver;
use crate::routing::Destination;
use crate::transport::Transport;
use crate::{Data, TaskId};

pub mod broadcast;
pub mod gather;
pub mod join;
pub mod keyed;
pub mod partition;
pub mod reduce;

pub use self::broadcast::Broadcast;
pub use self::gather::Gather;
pub use self::join::{Join, JoinReceiver};
pub use self::keyed::{GroupingReceiver, KeyedGather, KeyedPartition, SortedGroupingReceiver, SortedKeyedGather};
pub use self::partition::Partition;
pub use self::reduce::{Reduce, ReduceReceiver};

/// A channel operation with end-of-stream markers.
pub struct Collective<T: Data, X: Transport, R: MessageReceiver<T>> {
    operation: ChannelOperation<T, X, R>,
    // markers not yet accepted into a send queue.
    finishing: VecDeque<TaskId>,
    finished: BTreeSet<TaskId>,
}

impl<T: Data, X: Transport, R: MessageReceiver<T>> Collective<T, X, R> {
    /// Wraps `operation`.
    pub fn new(operation: ChannelOperation<T, X, R>) -> Self {
        Collective { operation, finishing: VecDeque::new(), finished: BTreeSet::new() }
    }

    /// The wrapped operation.
    pub fn operation(&self) -> &ChannelOperation<T, X, R> { &self.operation }
    /// The wrapped operation, mutably.
    pub fn operation_mut(&mut self) -> &mut ChannelOperation<T, X, R> { &mut self.operation }

    /// True once `source` called [`finish`](Self::finish).
    pub fn is_finished(&self, source: TaskId) -> bool {
        self.finished.contains(&source)
    }

    /// Queues a message, refusing sources that already finished.
    pub fn submit(&mut self, source: TaskId, destination: Destination, payload: Payload<T>, flags: u32) -> Result<bool> {
        if self.finished.contains(&source) {
            return Err(CommsError::SourceFinished { task: source });
        }
        self.operation.submit(source, destination, payload, flags)
    }

    /// Sends the raw bytes of a synchronisation barrier from `source` to every destination.
    pub fn barrier(&mut self, source: TaskId, bytes: Vec<u8>) -> Result<bool> {
        self.submit(source, Destination::All, Payload::Raw(bytes), flags::SYNC_BARRIER)
    }

    /// Ends the stream of `source`.
    ///
    /// The marker follows every message `source` submitted before; if its queue is full the
    /// marker is retried by [`progress`](Self::progress).
    pub fn finish(&mut self, source: TaskId) -> Result<()> {
        if self.operation.routing().local_sources().binary_search(&source).is_err() {
            return Err(CommsError::UnknownSource { task: source });
        }
        if self.finished.insert(source) {
            self.finishing.push_back(source);
        }
        self.flush_markers()
    }

    fn flush_markers(&mut self) -> Result<()> {
        let mut waiting = VecDeque::new();
        while let Some(source) = self.finishing.pop_front() {
            if !self.operation.can_submit(source) {
                waiting.push_back(source);
                continue;
            }
            self.operation.submit(source, Destination::All, Payload::Records(Vec::new()), flags::LAST)?;
        }
        self.finishing = waiting;
        Ok(())
    }

    /// Performs one step; true while work remains.
    pub fn progress(&mut self) -> Result<bool> {
        self.flush_markers()?;
        self.operation.progress()?;
        Ok(!self.is_complete())
    }

    /// True once every local source finished, nothing is in flight, and every marker arrived.
    pub fn is_complete(&self) -> bool {
        self.finishing.is_empty()
            && self.operation.routing().local_sources().iter().all(|s| self.finished.contains(s))
            && self.operation.is_complete()
            && self.operation.all_sources_finished()
    }

    /// Closes the wrapped operation.
    pub fn close(&mut self) -> Result<()> {
        self.operation.close()
    }
}

/// End-of-stream markers and barriers seen by the destinations of a receiver.
#[derive(Debug, Default)]
pub(crate) struct Markers {
    finished: BTreeMap<TaskId, BTreeSet<TaskId>>,
    barriers: usize,
}

impl Markers {
    /// Notes a delivery from `source` to `target`; true if it ended the stream of `source`.
    pub(crate) fn observe(&mut self, source: TaskId, target: TaskId, flags: u32) -> bool {
        if flags & flags::LAST == 0 {
            return false;
        }
        self.finished.entry(target).or_insert_with(BTreeSet::new).insert(source);
        true
    }

    pub(crate) fn has_finished(&self, target: TaskId, source: TaskId) -> bool {
        self.finished.get(&target).map(|s| s.contains(&source)).unwrap_or(false)
    }

    pub(crate) fn finished_streams(&self, target: TaskId) -> usize {
        self.finished.get(&target).map(|s| s.len()).unwrap_or(0)
    }

    pub(crate) fn barrier(&mut self) {
        self.barriers += 1;
    }

    pub(crate) fn barriers(&self) -> usize { self.barriers }
}
