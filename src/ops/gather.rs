//! Every source sending to one target.

use crate::error::{CommsError, Result};
use crate::message::Payload;
use crate::operation::ChannelOperation;
use crate::receiver::MessageReceiver;
use crate::routing::Destination;
use crate::transport::Transport;
use crate::{Data, TaskId};

use super::Collective;

/// Collects the records of every source at one destination task.
pub struct Gather<T: Data, X: Transport, R: MessageReceiver<T>> {
    collective: Collective<T, X, R>,
    target: TaskId,
}

impl<T: Data, X: Transport, R: MessageReceiver<T>> Gather<T, X, R> {
    /// A gather at `target`, which must be a destination of `operation`.
    pub fn new(operation: ChannelOperation<T, X, R>, target: TaskId) -> Result<Self> {
        if operation.routing().destinations().binary_search(&target).is_err() {
            return Err(CommsError::UnknownDestination { task: target });
        }
        Ok(Gather { collective: Collective::new(operation), target })
    }

    /// The gathering task.
    pub fn target(&self) -> TaskId { self.target }

    /// Sends `records` from `source` to the target.
    pub fn gather(&mut self, source: TaskId, records: Vec<T>) -> Result<bool> {
        self.collective.submit(source, Destination::Task(self.target), Payload::Records(records), 0)
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
}
