//! The channel operation: moving messages of one edge through every phase.
//!
//! A [`ChannelOperation`] accepts messages from its local sources, delivers them to destination
//! tasks of this worker in memory, serializes them into chunks for other workers and hands the
//! chunks to a [`Transport`]. In the other direction it collects the chunks arriving from other
//! workers, rebuilds their messages and delivers them to a [`MessageReceiver`].
//!
//! Nothing blocks. Each call to [`progress`](ChannelOperation::progress) performs one bounded
//! step for one source and one step for one remote source, chosen round-robin. Buffers come from
//! two fixed pools allocated when the operation starts.
//!
//! Backpressure is reported as `Ok(false)`. Any error leaves the operation aborted.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::marker::PhantomData;

use crossbeam_channel::{Receiver, Sender};

use crate::buffer::{BufferPool, DataBuffer};
use crate::config::CommsConfig;
use crate::deserializer::MessageDeserializer;
use crate::error::{CommsError, Result};
use crate::group::ReceiveGroups;
use crate::header::flags;
use crate::logging::{BufferEvent, CommsLogger, GroupEvent, MessageEvent, StateEvent};
use crate::message::{ChannelMessage, InMessage, OutMessage, Payload, ReceivedState, SendState};
use crate::progress::ProgressTracker;
use crate::receiver::MessageReceiver;
use crate::routing::{Destination, RoutingTable};
use crate::serializer::MessageSerializer;
use crate::transport::{ChannelEvent, Transport};
use crate::{Data, EdgeId, TaskId, WorkerId};

/// Buffers posted to one receiving worker.
struct Posted {
    sender: Sender<DataBuffer>,
    // a second handle onto the same queue, to take back buffers nothing was written to.
    reclaim: Receiver<DataBuffer>,
    count: usize,
}

/// Where the buffers of an operation are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferStats {
    /// buffers in the send pool family.
    pub send_total: usize,
    /// free send buffers.
    pub send_free: usize,
    /// send buffers holding chunks not yet acknowledged.
    pub send_in_flight: usize,
    /// buffers in the receive pool family.
    pub receive_total: usize,
    /// free receive buffers.
    pub receive_free: usize,
    /// receive buffers posted to the transport, filled ones not yet drained included.
    pub receive_posted: usize,
    /// receive buffers held by messages being rebuilt.
    pub receive_held: usize,
}

impl BufferStats {
    /// True if every buffer is accounted for exactly once.
    pub fn is_conserved(&self) -> bool {
        self.send_free + self.send_in_flight == self.send_total
            && self.receive_free + self.receive_posted + self.receive_held == self.receive_total
    }
}

/// The engine of one edge on one worker.
pub struct ChannelOperation<T: Data, X: Transport, R: MessageReceiver<T>> {
    edge: EdgeId,
    config: CommsConfig,
    routing: RoutingTable,
    transport: X,
    receiver: R,
    serializer: MessageSerializer,
    deserializer: MessageDeserializer,

    send_pool: BufferPool,
    receive_pool: BufferPool,

    pending_sends: BTreeMap<TaskId, VecDeque<OutMessage<T>>>,
    pending_receives: BTreeMap<TaskId, VecDeque<InMessage<T>>>,
    in_flight: HashMap<u64, ChannelMessage>,
    next_ticket: u64,
    external_sends_pending: usize,

    send_tracker: ProgressTracker,
    receive_tracker: ProgressTracker,
    groups: ReceiveGroups,
    posted: BTreeMap<WorkerId, Posted>,
    finished_sources: BTreeMap<TaskId, bool>,

    events: Sender<ChannelEvent>,
    event_queue: Receiver<ChannelEvent>,

    started: bool,
    closed: bool,
    aborted: bool,
    logger: Option<CommsLogger>,
    phantom: PhantomData<T>,
}

impl<T: Data, X: Transport, R: MessageReceiver<T>> ChannelOperation<T, X, R> {
    /// An operation on `edge` routed by `routing`.
    ///
    /// The send pool is allocated here; receive buffers are allocated on the first call to
    /// [`progress`](Self::progress), after any receive groups were installed.
    pub fn new(config: CommsConfig, routing: RoutingTable, edge: EdgeId, mut transport: X, receiver: R) -> Result<Self> {
        config.validate()?;
        let worker = routing.this_worker();
        let send_buffers = (0 .. config.send_buffer_count).map(|_| transport.create_buffer(config.buffer_size)).collect();
        let (events, event_queue) = crossbeam_channel::unbounded();

        let pending_sends = routing.local_sources().iter().map(|s| (*s, VecDeque::new())).collect();
        let pending_receives = routing.remote_sources().iter().map(|s| (*s, VecDeque::new())).collect();
        let finished_sources = routing.sources().iter().map(|s| (*s, false)).collect();

        Ok(ChannelOperation {
            edge,
            serializer: MessageSerializer::new(edge, worker, false),
            deserializer: MessageDeserializer::new(edge),
            send_pool: BufferPool::with_buffers("send", send_buffers),
            receive_pool: BufferPool::new("receive", 0),
            pending_sends,
            pending_receives,
            in_flight: HashMap::new(),
            next_ticket: 0,
            external_sends_pending: 0,
            send_tracker: ProgressTracker::new(routing.local_sources().iter().cloned()),
            receive_tracker: ProgressTracker::new(routing.remote_sources().iter().cloned()),
            groups: ReceiveGroups::single(routing.receiving_workers()),
            posted: BTreeMap::new(),
            finished_sources,
            events,
            event_queue,
            started: false,
            closed: false,
            aborted: false,
            logger: None,
            phantom: PhantomData,
            config,
            routing,
            transport,
            receiver,
        })
    }

    /// Flags every chunk as carrying key/value records.
    pub fn keyed(mut self) -> Self {
        self.serializer = MessageSerializer::new(self.edge, self.routing.this_worker(), true);
        self
    }

    /// Reports communication events to `logger`.
    pub fn with_logger(mut self, logger: CommsLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Installs or removes the logger of communication events.
    pub fn set_logger(&mut self, logger: Option<CommsLogger>) {
        self.logger = logger;
    }

    /// The edge of the operation.
    pub fn edge(&self) -> EdgeId { self.edge }
    /// Routing information.
    pub fn routing(&self) -> &RoutingTable { &self.routing }
    /// The receiver of delivered messages.
    pub fn receiver(&self) -> &R { &self.receiver }
    /// The receiver of delivered messages, mutably.
    pub fn receiver_mut(&mut self) -> &mut R { &mut self.receiver }
    /// The receive group rotation.
    pub fn receive_groups(&self) -> &ReceiveGroups { &self.groups }
    /// The transport.
    pub fn transport(&self) -> &X { &self.transport }

    /// Partitions the receiving workers into groups admitted one at a time, starting at `initial`.
    pub fn setup_receive_groups(&mut self, initial: usize, groups: Vec<Vec<WorkerId>>) -> Result<()> {
        self.check_open()?;
        if self.started {
            return Err(CommsError::GroupsAfterStart);
        }
        self.groups = ReceiveGroups::setup(initial, groups, self.routing.receiving_workers())?;
        Ok(())
    }

    /// The configuration of the operation.
    pub fn config(&self) -> &CommsConfig { &self.config }

    /// True if a submit from `source` would be queued now.
    pub fn can_submit(&self, source: TaskId) -> bool {
        !self.closed && !self.aborted
            && self.pending_sends.get(&source).map(|q| q.len() < self.config.send_pending_max).unwrap_or(false)
    }

    /// Queues a message from `source`; `Ok(false)` if its queue is full.
    ///
    /// Raw payloads travel as synchronisation barriers; the barrier flag is ignored on any other
    /// payload.
    pub fn submit(&mut self, source: TaskId, destination: Destination, payload: Payload<T>, flags: u32) -> Result<bool> {
        self.check_open()?;
        let result = self.submit_inner(source, destination, payload, flags);
        self.guard(result)
    }

    fn submit_inner(&mut self, source: TaskId, destination: Destination, payload: Payload<T>, mut flags: u32) -> Result<bool> {
        let routing = self.routing.routes(source, destination)?;
        let queue = self.pending_sends.get_mut(&source).ok_or(CommsError::UnknownSource { task: source })?;
        if queue.len() >= self.config.send_pending_max {
            return Ok(false);
        }
        match payload {
            Payload::Raw(_) => flags |= flags::SYNC_BARRIER,
            _ => flags &= !flags::SYNC_BARRIER,
        }
        queue.push_back(OutMessage::new(source, routing, payload, flags));
        Ok(true)
    }

    /// Performs one bounded step of sending and one of receiving.
    pub fn progress(&mut self) -> Result<()> {
        self.check_open()?;
        let result = self.progress_inner();
        self.guard(result)
    }

    fn progress_inner(&mut self) -> Result<()> {
        if !self.started {
            self.start();
        }
        self.transport.progress();
        self.drain_events()?;

        if self.groups.is_retired() {
            self.advance_group()?;
        }
        self.top_up()?;

        if let Some(source) = self.send_tracker.next() {
            let result = self.send_step(source);
            self.send_tracker.finish(source);
            result?;
        }
        if let Some(source) = self.receive_tracker.next() {
            let result = self.receive_step(source);
            self.receive_tracker.finish(source);
            result?;
        }
        Ok(())
    }

    /// True when nothing is queued, in flight, or waiting at the transport.
    pub fn is_complete(&self) -> bool {
        self.pending_sends.values().all(|q| q.is_empty())
            && self.pending_receives.values().all(|q| q.is_empty())
            && self.in_flight.is_empty()
            && self.external_sends_pending == 0
            && self.event_queue.is_empty()
            && !self.transport.has_pending(self.edge)
    }

    /// True once `source` delivered its end-of-stream marker here.
    pub fn is_source_finished(&self, source: TaskId) -> bool {
        self.finished_sources.get(&source).cloned().unwrap_or(false)
    }

    /// True once every source delivered its end-of-stream marker, or nothing is received here.
    pub fn all_sources_finished(&self) -> bool {
        self.routing.local_destinations().is_empty() || self.finished_sources.values().all(|f| *f)
    }

    /// True after a fatal error.
    pub fn is_aborted(&self) -> bool { self.aborted }

    /// Accepts a buffer filled by the transport with a chunk from `worker`.
    pub fn on_buffer_filled(&mut self, buffer: DataBuffer, worker: WorkerId) -> Result<()> {
        self.check_open()?;
        let result = self.accept_buffer(buffer, worker);
        self.guard(result)
    }

    /// Accepts the acknowledgement of a chunk handed to the transport.
    pub fn on_send_acknowledged(&mut self, ticket: u64) -> Result<()> {
        self.check_open()?;
        let result = self.acknowledge(ticket);
        self.guard(result)
    }

    /// Stops receiving and returns every buffer to its pool. Later calls fail with `Closed`.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let workers: Vec<_> = self.posted.keys().cloned().collect();
        for worker in workers.iter() {
            self.transport.release_buffers(*worker, self.edge);
        }
        let mut result = Ok(());
        for worker in workers {
            if let Err(error) = self.reclaim(worker) {
                result = Err(error);
            }
        }
        while let Ok(event) = self.event_queue.try_recv() {
            match event {
                ChannelEvent::Received { worker, buffer } | ChannelEvent::Rejected { worker, buffer, .. } => {
                    if let Some(posted) = self.posted.get_mut(&worker) {
                        posted.count = posted.count.saturating_sub(1);
                    }
                    if let Err(error) = self.receive_pool.release(buffer) {
                        result = Err(error);
                    }
                }
                ChannelEvent::SendComplete { .. } => { }
            }
        }
        for (_, queue) in ::std::mem::replace(&mut self.pending_receives, BTreeMap::new()) {
            for mut message in queue {
                for chunk in message.pending.drain(..).chain(message.built.drain(..)) {
                    if let Err(error) = self.receive_pool.release(chunk.into_buffer()) {
                        result = Err(error);
                    }
                }
            }
        }
        for (_, chunk) in self.in_flight.drain() {
            if let Err(error) = self.send_pool.release(chunk.into_buffer()) {
                result = Err(error);
            }
        }
        for queue in self.pending_sends.values_mut() {
            queue.clear();
        }
        self.external_sends_pending = 0;
        self.closed = true;
        let send = BufferEvent { receive: false, free: self.send_pool.available(), total: self.send_pool.capacity() };
        let receive = BufferEvent { receive: true, free: self.receive_pool.available(), total: self.receive_pool.capacity() };
        self.logger.as_mut().map(|l| {
            l.log(send);
            l.log(receive);
            l.log(StateEvent { send: false, remote: None, start: false });
        });
        result
    }

    /// Where every buffer currently is.
    pub fn buffer_stats(&self) -> BufferStats {
        BufferStats {
            send_total: self.send_pool.capacity(),
            send_free: self.send_pool.available(),
            send_in_flight: self.in_flight.len(),
            receive_total: self.receive_pool.capacity(),
            receive_free: self.receive_pool.available(),
            receive_posted: self.posted.values().map(|p| p.count).sum(),
            receive_held: self.pending_receives.values().flat_map(|q| q.iter()).map(|m| m.held_buffers()).sum(),
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(CommsError::Closed)
        }
        else if self.aborted {
            Err(CommsError::Aborted)
        }
        else {
            Ok(())
        }
    }

    fn guard<V>(&mut self, result: Result<V>) -> Result<V> {
        if let Err(error) = &result {
            if error.is_fatal() {
                self.aborted = true;
            }
        }
        result
    }

    /// Allocates the receive pool and registers with the transport.
    fn start(&mut self) {
        let total = self.config.receive_buffer_count * self.groups.max_group_size();
        let buffers = (0 .. total).map(|_| self.transport.create_buffer(self.config.buffer_size)).collect();
        self.receive_pool = BufferPool::with_buffers("receive", buffers);
        for &worker in self.routing.receiving_workers() {
            let (sender, reclaim) = crossbeam_channel::unbounded();
            self.transport.receive_message(worker, self.edge, self.events.clone(), reclaim.clone());
            self.posted.insert(worker, Posted { sender, reclaim, count: 0 });
        }
        self.started = true;
        let event = BufferEvent { receive: true, free: total, total };
        self.logger.as_mut().map(|l| {
            l.log(StateEvent { send: false, remote: None, start: true });
            l.log(event);
        });
        if self.groups.is_rotating() {
            let event = GroupEvent { group: self.groups.current_index(), round: 0, workers: self.groups.current_group().len() };
            self.logger.as_mut().map(|l| l.log(event));
        }
    }

    fn drain_events(&mut self) -> Result<()> {
        while let Ok(event) = self.event_queue.try_recv() {
            match event {
                ChannelEvent::Received { worker, buffer } => self.accept_buffer(buffer, worker)?,
                ChannelEvent::SendComplete { ticket } => self.acknowledge(ticket)?,
                ChannelEvent::Rejected { worker, buffer, error } => {
                    if let Some(posted) = self.posted.get_mut(&worker) {
                        posted.count = posted.count.saturating_sub(1);
                    }
                    self.receive_pool.release(buffer)?;
                    return Err(error);
                }
            }
        }
        Ok(())
    }

    fn acknowledge(&mut self, ticket: u64) -> Result<()> {
        let release = match self.in_flight.get_mut(&ticket) {
            Some(chunk) if chunk.ref_count > 0 => {
                chunk.ref_count -= 1;
                chunk.ref_count == 0
            }
            _ => return Err(CommsError::UnknownTicket { ticket }),
        };
        self.external_sends_pending -= 1;
        if release {
            if let Some(chunk) = self.in_flight.remove(&ticket) {
                self.send_pool.release(chunk.into_buffer())?;
            }
        }
        Ok(())
    }

    fn accept_buffer(&mut self, buffer: DataBuffer, worker: WorkerId) -> Result<()> {
        let header = self.deserializer.build_header(&buffer)?;
        match self.posted.get_mut(&worker) {
            Some(posted) if posted.count > 0 => posted.count -= 1,
            _ => return Err(CommsError::malformed(self.edge, format!("chunk from worker {} without posted buffers", worker))),
        }
        self.logger.as_mut().map(|l| l.log(MessageEvent { is_send: false, peer: worker, header }));

        let source = header.source as TaskId;
        if self.routing.plan().worker_of(source) != Some(worker) {
            return Err(CommsError::malformed(self.edge, format!("task {} is not hosted by worker {}", source, worker)));
        }
        let targets = match header.destination_task() {
            None => self.routing.local_destinations().to_vec(),
            Some(task) if self.routing.is_local_destination(task) => vec![task],
            Some(task) => return Err(CommsError::malformed(self.edge, format!("chunk for task {} not hosted here", task))),
        };
        let limit = self.config.receive_pending_max + self.config.receive_buffer_count;
        let queue = self.pending_receives.get_mut(&source).ok_or(CommsError::UnknownSource { task: source })?;

        if queue.back().map(|m| m.is_arrived()).unwrap_or(true) {
            if queue.len() >= limit {
                return Err(CommsError::ReceiveQueueOverflow { task: source, limit });
            }
            queue.push_back(InMessage::new(worker, header, header.has_flag(flags::SYNC_BARRIER), targets));
        }
        let arrived = match queue.back_mut() {
            Some(message) => message.add_buffer_and_calculate(ChannelMessage::incoming(header, buffer, worker))?,
            None => false,
        };
        if arrived && self.groups.is_rotating() {
            self.groups.mark_arrived(worker);
            self.reclaim(worker)?;
        }
        Ok(())
    }

    /// Takes back the buffers posted to `worker` that were not filled.
    fn reclaim(&mut self, worker: WorkerId) -> Result<()> {
        if let Some(posted) = self.posted.get_mut(&worker) {
            while let Ok(buffer) = posted.reclaim.try_recv() {
                posted.count -= 1;
                self.receive_pool.release(buffer)?;
            }
        }
        Ok(())
    }

    fn is_throttled(&self, worker: WorkerId) -> bool {
        let max = self.config.receive_pending_max;
        self.routing.sources_on(worker).any(|s| self.pending_receives.get(&s).map(|q| q.len() >= max).unwrap_or(false))
    }

    /// Posts free buffers to admitted workers, up to the configured count each.
    fn top_up(&mut self) -> Result<()> {
        let workers: Vec<_> = self.posted.keys().cloned().collect();
        for worker in workers {
            if !self.groups.wants_buffers(worker) || self.is_throttled(worker) {
                continue;
            }
            if let Some(posted) = self.posted.get_mut(&worker) {
                while posted.count < self.config.receive_buffer_count {
                    let buffer = match self.receive_pool.acquire() {
                        Some(buffer) => buffer,
                        None => return Ok(()),
                    };
                    if posted.sender.send(buffer).is_err() {
                        return Err(CommsError::Closed);
                    }
                    posted.count += 1;
                }
            }
        }
        Ok(())
    }

    fn advance_group(&mut self) -> Result<()> {
        let workers: Vec<_> = self.posted.keys().cloned().collect();
        for worker in workers {
            self.reclaim(worker)?;
        }
        if self.groups.advance() {
            let event = GroupEvent {
                group: self.groups.current_index(),
                round: self.groups.round(),
                workers: self.groups.current_group().len(),
            };
            self.logger.as_mut().map(|l| l.log(event));
        }
        Ok(())
    }

    /// One cycle for `source`: deliver internally, build a chunk, transmit the head chunk.
    fn send_step(&mut self, source: TaskId) -> Result<()> {
        let edge = self.edge;
        let queue = match self.pending_sends.get_mut(&source) {
            Some(queue) => queue,
            None => return Ok(()),
        };
        let message = match queue.front_mut() {
            Some(message) => message,
            None => return Ok(()),
        };

        if message.state() < SendState::SentInternally {
            while message.accepted_internal < message.routing().internal_routes.len() {
                let target = message.routing().internal_routes[message.accepted_internal];
                let accepted = match message.payload() {
                    Payload::Raw(bytes) => self.receiver.sync(source, target, bytes),
                    payload => self.receiver.receive_send_internally(source, target, message.flags(), payload),
                };
                if !accepted {
                    return Ok(());
                }
                message.accepted_internal += 1;
            }
            message.set_state(SendState::SentInternally)?;
            if message.flags() & flags::LAST != 0 && !message.routing().internal_routes.is_empty() {
                self.finished_sources.insert(source, true);
            }
            if message.routing().external_routes.is_empty() {
                message.set_state(SendState::Sent)?;
                queue.pop_front();
                self.receiver.send_completed(source);
                return Ok(());
            }
        }

        if message.state() < SendState::Serialized {
            if let Some(chunk) = self.serializer.build(message, &mut self.send_pool)? {
                let ticket = self.next_ticket;
                self.next_ticket += 1;
                message.tickets.push_back(ticket);
                self.in_flight.insert(ticket, chunk);
            }
        }

        if let Some(&ticket) = message.tickets.front() {
            let chunk = self.in_flight.get_mut(&ticket).ok_or(CommsError::UnknownTicket { ticket })?;
            let routes = &message.routing().external_routes;
            if !chunk.out_count_updated {
                chunk.ref_count += routes.len();
                chunk.out_count_updated = true;
                self.external_sends_pending += routes.len();
            }
            while chunk.accepted_external_sends < routes.len() {
                let worker = routes[chunk.accepted_external_sends];
                if !self.transport.send_message(worker, edge, ticket, chunk.bytes(), &self.events) {
                    break;
                }
                chunk.accepted_external_sends += 1;
                let header = *chunk.header();
                self.logger.as_mut().map(|l| l.log(MessageEvent { is_send: true, peer: worker, header }));
            }
            if chunk.accepted_external_sends == routes.len() {
                message.tickets.pop_front();
            }
        }

        if message.state() == SendState::Serialized && message.tickets.is_empty() {
            message.set_state(SendState::Sent)?;
            queue.pop_front();
            self.receiver.send_completed(source);
        }
        Ok(())
    }

    /// One cycle for remote `source`: unpack what arrived, hand over chunks, deliver the head.
    fn receive_step(&mut self, source: TaskId) -> Result<()> {
        let queue = match self.pending_receives.get_mut(&source) {
            Some(queue) => queue,
            None => return Ok(()),
        };

        if let Some(message) = queue.iter_mut().find(|m| m.state() < ReceivedState::Built) {
            if !message.pending.is_empty() {
                self.deserializer.build(message)?;
            }
        }

        'handoff: for message in queue.iter_mut() {
            while let Some(chunk) = message.built.front() {
                if !self.receiver.handle_received_channel_message(chunk) {
                    break 'handoff;
                }
                if let Some(chunk) = message.built.pop_front() {
                    self.receive_pool.release(chunk.into_buffer())?;
                }
            }
            if message.state() == ReceivedState::Built && message.pending.is_empty() {
                message.set_state(ReceivedState::Receive)?;
            }
            if message.state() < ReceivedState::Built {
                break;
            }
        }

        let message = match queue.front_mut() {
            Some(message) if message.state() == ReceivedState::Receive => message,
            _ => return Ok(()),
        };
        let worker = message.worker();
        if !self.groups.may_deliver(worker) {
            return Ok(());
        }
        let header = *message.header();
        while message.delivered < message.targets().len() {
            let target = message.targets()[message.delivered];
            let accepted = match message.payload() {
                Some(Payload::Raw(bytes)) => self.receiver.sync(source, target, bytes),
                Some(payload) => self.receiver.receive_message(target, &header, payload),
                None => return Err(CommsError::malformed(self.edge, "delivering a message that was not built")),
            };
            if !accepted {
                return Ok(());
            }
            message.delivered += 1;
        }
        message.set_state(ReceivedState::Done)?;
        queue.pop_front();
        self.groups.record_completion(worker)?;

        if header.has_flag(flags::LAST) {
            self.finished_sources.insert(source, true);
            let finished = self.routing.sources_on(worker).all(|s| self.finished_sources.get(&s).cloned().unwrap_or(false));
            if finished {
                self.groups.mark_finished(worker);
            }
        }
        Ok(())
    }
}
