//! Records addressed to one chosen destination each.

use crate::error::Result;
use crate::message::Payload;
use crate::operation::ChannelOperation;
use crate::receiver::MessageReceiver;
use crate::routing::Destination;
use crate::transport::Transport;
use crate::{Data, TaskId};

use super::Collective;

/// Sends messages from local sources to destinations picked by the caller.
pub struct Partition<T: Data, X: Transport, R: MessageReceiver<T>> {
    collective: Collective<T, X, R>,
}

impl<T: Data, X: Transport, R: MessageReceiver<T>> Partition<T, X, R> {
    /// A partition over `operation`.
    pub fn new(operation: ChannelOperation<T, X, R>) -> Self {
        Partition { collective: Collective::new(operation) }
    }

    /// Sends `records` from `source` to `destination`; `Ok(false)` if the source's queue is full.
    pub fn partition(&mut self, source: TaskId, destination: TaskId, records: Vec<T>, flags: u32) -> Result<bool> {
        self.collective.submit(source, Destination::Task(destination), Payload::Records(records), flags)
    }

    /// Sends one non-enumerable `record` from `source` to `destination`.
    pub fn send_single(&mut self, source: TaskId, destination: TaskId, record: T, flags: u32) -> Result<bool> {
        self.collective.submit(source, Destination::Task(destination), Payload::Single(record), flags)
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
    pub fn collective(&self) -> &Collective<T, X, R> { &self.collective }
    /// The wrapped collective, mutably.
    pub fn collective_mut(&mut self) -> &mut Collective<T, X, R> { &mut self.collective }
}
