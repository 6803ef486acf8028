//! The consumer of delivered messages.

use crate::header::MessageHeader;
use crate::message::{ChannelMessage, Payload};
use crate::TaskId;

/// Accepts messages delivered by a channel operation.
///
/// Every method returning `bool` may refuse with `false`; the operation keeps the message and
/// offers it again on a later progress call.
pub trait MessageReceiver<T> {
    /// Delivers a message that arrived from another worker to `target`.
    fn receive_message(&mut self, target: TaskId, header: &MessageHeader, payload: &Payload<T>) -> bool;

    /// Delivers a message between tasks of this worker.
    fn receive_send_internally(&mut self, source: TaskId, target: TaskId, flags: u32, payload: &Payload<T>) -> bool;

    /// Delivers the raw bytes of a synchronisation barrier from `source` to `target`.
    fn sync(&mut self, source: TaskId, target: TaskId, bytes: &[u8]) -> bool;

    /// Observes an unpacked chunk before its buffer is recycled.
    fn handle_received_channel_message(&mut self, _message: &ChannelMessage) -> bool {
        true
    }

    /// Reports that a message of `source` left the operation.
    fn send_completed(&mut self, _source: TaskId) { }
}

/// A delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery<T> {
    /// the sending task.
    pub source: TaskId,
    /// the receiving task.
    pub target: TaskId,
    /// header flags.
    pub flags: u32,
    /// what was sent.
    pub payload: Payload<T>,
}

/// Records every delivery in order.
///
/// With a capacity, deliveries are refused while that many are held, until
/// [`take`](CollectingReceiver::take) drains them.
#[derive(Debug, Clone)]
pub struct CollectingReceiver<T> {
    deliveries: Vec<Delivery<T>>,
    capacity: Option<usize>,
    completed_sends: usize,
    chunks: usize,
}

impl<T> Default for CollectingReceiver<T> {
    fn default() -> Self {
        CollectingReceiver { deliveries: Vec::new(), capacity: None, completed_sends: 0, chunks: 0 }
    }
}

impl<T: Clone> CollectingReceiver<T> {
    /// A receiver without a capacity.
    pub fn new() -> Self { Self::default() }

    /// A receiver holding at most `capacity` deliveries.
    pub fn with_capacity(capacity: usize) -> Self {
        CollectingReceiver { capacity: Some(capacity), ..Self::default() }
    }

    /// Deliveries so far.
    pub fn deliveries(&self) -> &[Delivery<T>] { &self.deliveries }
    /// Removes and returns the deliveries so far.
    pub fn take(&mut self) -> Vec<Delivery<T>> { ::std::mem::replace(&mut self.deliveries, Vec::new()) }
    /// Messages that left the operation.
    pub fn completed_sends(&self) -> usize { self.completed_sends }
    /// Chunks observed.
    pub fn chunks(&self) -> usize { self.chunks }

    /// Every delivered record as `(source, target, record)`, in delivery order.
    pub fn records(&self) -> Vec<(TaskId, TaskId, T)> {
        self.deliveries.iter()
            .flat_map(|d| d.payload.records().iter().map(move |r| (d.source, d.target, r.clone())))
            .collect()
    }

    fn accept(&mut self, delivery: Delivery<T>) -> bool {
        if self.capacity.map(|c| self.deliveries.len() >= c).unwrap_or(false) {
            return false;
        }
        self.deliveries.push(delivery);
        true
    }
}

impl<T: Clone> MessageReceiver<T> for CollectingReceiver<T> {
    fn receive_message(&mut self, target: TaskId, header: &MessageHeader, payload: &Payload<T>) -> bool {
        self.accept(Delivery { source: header.source as TaskId, target, flags: header.flags, payload: payload.clone() })
    }
    fn receive_send_internally(&mut self, source: TaskId, target: TaskId, flags: u32, payload: &Payload<T>) -> bool {
        self.accept(Delivery { source, target, flags, payload: payload.clone() })
    }
    fn sync(&mut self, source: TaskId, target: TaskId, bytes: &[u8]) -> bool {
        self.accept(Delivery { source, target, flags: crate::header::flags::SYNC_BARRIER, payload: Payload::Raw(bytes.to_vec()) })
    }
    fn handle_received_channel_message(&mut self, _message: &ChannelMessage) -> bool {
        self.chunks += 1;
        true
    }
    fn send_completed(&mut self, _source: TaskId) {
        self.completed_sends += 1;
    }
}
