//! A transport over one TCP connection per pair of worker processes.
//!
//! Every peer connection is served by a send thread and a receive thread. The worker queues
//! frames on a [`FrameSender`], which the send thread writes to the socket in batches. The
//! receive thread cuts the stream into frames and copies each into a buffer posted for its
//! edge, or stashes it until one is posted.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, BufWriter, Write};
use std::net::{TcpListener, TcpStream};
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use bytes::arc::Bytes;
use crossbeam_channel::{Receiver, Sender};

use super::frames::{frame_channel, FrameReader, FrameSender, FrameSink};
use super::network::{create_sockets, create_sockets_with_listener};
use super::{ChannelEvent, Inbox, Transport};
use crate::buffer::DataBuffer;
use crate::config::NetworkConfig;
use crate::header::MessageHeader;
use crate::logging::{CommsLogger, CommsSetup, MessageEvent, StateEvent};
use crate::{EdgeId, WorkerId};

/// Builds the logger of a network thread.
pub type LogFn = Arc<dyn Fn(CommsSetup) -> Option<CommsLogger> + Send + Sync>;

/// Written frames kept for reuse by each connection.
const SPARE_FRAMES: usize = 64;

/// Bytes a receive thread stages before its first frame needs more.
const READ_CAPACITY: usize = 1 << 20;

/// Inboxes keyed by (edge, sending worker), shared with the receive threads.
type Inbound = Arc<Mutex<HashMap<(EdgeId, WorkerId), Inbox>>>;

struct TcpInner {
    index: WorkerId,
    sends: Vec<Option<FrameSender>>,
    inbound: Inbound,
    threads: Vec<JoinHandle<()>>,
}

/// A worker's handle onto its TCP connections.
///
/// Handles are cheap to clone and are shared by every operation of the worker thread.
#[derive(Clone)]
pub struct TcpTransport {
    inner: Rc<RefCell<TcpInner>>,
}

impl TcpTransport {
    /// Connects worker `config.process` to every address of `config`.
    pub fn from_config(config: &NetworkConfig, log_fn: LogFn) -> io::Result<Self> {
        let sockets = create_sockets(config.peer_workers_addrs.clone(), config.process, config.report)?;
        Self::from_sockets(config.process, sockets, log_fn)
    }

    /// Connects worker `index`, accepting peers on an already bound `listener`.
    pub fn connect(index: WorkerId, listener: TcpListener, addresses: Vec<String>, log_fn: LogFn) -> io::Result<Self> {
        let sockets = create_sockets_with_listener(listener, addresses, index, false)?;
        Self::from_sockets(index, sockets, log_fn)
    }

    fn from_sockets(index: WorkerId, sockets: Vec<Option<TcpStream>>, log_fn: LogFn) -> io::Result<Self> {
        let inbound: Inbound = Arc::new(Mutex::new(HashMap::new()));
        let mut sends = Vec::with_capacity(sockets.len());
        let mut threads = Vec::new();

        for (remote, socket) in sockets.into_iter().enumerate() {
            let stream = match socket {
                Some(stream) => stream,
                None => {
                    sends.push(None);
                    continue;
                }
            };
            let reader = stream.try_clone()?;

            let (frames, sink) = frame_channel(SPARE_FRAMES);
            let log_send = log_fn.clone();
            threads.push(thread::Builder::new()
                .name(format!("comms:send-{}-{}", index, remote))
                .spawn(move || {
                    let logger = log_send(CommsSetup { worker: index, edge: remote, network: true });
                    send_loop(stream, sink, index, remote, logger);
                })?);

            let log_recv = log_fn.clone();
            let targets = inbound.clone();
            threads.push(thread::Builder::new()
                .name(format!("comms:recv-{}-{}", index, remote))
                .spawn(move || {
                    let logger = log_recv(CommsSetup { worker: index, edge: remote, network: true });
                    recv_loop(reader, targets, index, remote, logger);
                })?);

            sends.push(Some(frames));
        }

        Ok(TcpTransport {
            inner: Rc::new(RefCell::new(TcpInner { index, sends, inbound, threads })),
        })
    }

    /// The index of this worker.
    pub fn index(&self) -> WorkerId {
        self.inner.borrow().index
    }

    /// Closes the outgoing side of every connection and waits for the network threads.
    ///
    /// Returns once every peer has closed its side as well.
    pub fn shutdown(&self) {
        let threads = {
            let mut inner = self.inner.borrow_mut();
            inner.sends.clear();
            ::std::mem::replace(&mut inner.threads, Vec::new())
        };
        for thread in threads {
            if thread.join().is_err() {
                eprintln!("comms: network thread panicked");
            }
        }
    }
}

impl Transport for TcpTransport {
    fn send_message(&mut self, worker: WorkerId, _edge: EdgeId, ticket: u64, bytes: &[u8], listener: &Sender<ChannelEvent>) -> bool {
        let mut inner = self.inner.borrow_mut();
        match inner.sends.get_mut(worker) {
            // the frame is copied, so the sender's buffer is free once it is queued.
            Some(Some(frames)) => frames.send(bytes) && listener.send(ChannelEvent::SendComplete { ticket }).is_ok(),
            _ => false,
        }
    }

    fn receive_message(&mut self, worker: WorkerId, edge: EdgeId, listener: Sender<ChannelEvent>, buffers: Receiver<DataBuffer>) {
        let inner = self.inner.borrow();
        let mut inbound = inner.inbound.lock().expect("inbound mutex poisoned");
        let inbox = inbound.entry((edge, worker)).or_insert_with(Inbox::default);
        inbox.register(listener, buffers);
        inbox.flush(worker);
    }

    fn release_buffers(&mut self, worker: WorkerId, edge: EdgeId) {
        let inner = self.inner.borrow();
        let mut inbound = inner.inbound.lock().expect("inbound mutex poisoned");
        if let Some(inbox) = inbound.get_mut(&(edge, worker)) {
            inbox.deregister();
        }
    }

    fn progress(&mut self) {
        let inner = self.inner.borrow();
        let mut inbound = inner.inbound.lock().expect("inbound mutex poisoned");
        for (&(_edge, worker), inbox) in inbound.iter_mut() {
            inbox.flush(worker);
        }
    }

    fn has_pending(&self, edge: EdgeId) -> bool {
        let inner = self.inner.borrow();
        let inbound = inner.inbound.lock().expect("inbound mutex poisoned");
        inbound.iter().any(|(&(e, _), inbox)| e == edge && inbox.stashed() > 0)
    }
}

/// Reads frames from `remote` and dispatches them to the inboxes of their edges.
fn recv_loop(mut reader: TcpStream, targets: Inbound, local: WorkerId, remote: WorkerId, mut logger: Option<CommsLogger>) {
    logger.as_mut().map(|l| l.log(StateEvent { send: false, remote: Some(remote), start: true }));

    let mut frames = FrameReader::new(READ_CAPACITY);
    let mut active = true;
    while active {
        let read = match frames.fill(&mut reader) {
            Ok(n) => n,
            Err(x) => {
                eprintln!("worker {}:\terror reading from worker {}: {:?}", local, remote, x);
                0
            },
        };
        if read == 0 {
            panic!("worker {}: connection from worker {} closed without shutdown", local, remote);
        }

        // the lock is taken once per read, and only when a frame completed.
        let mut inbound = None;
        while let Some((header, bytes)) = frames.next_frame() {
            if header.is_shutdown() {
                active = false;
                break;
            }
            logger.as_mut().map(|l| l.log(MessageEvent { is_send: false, peer: remote, header }));
            let inbound = inbound.get_or_insert_with(|| targets.lock().expect("inbound mutex poisoned"));
            let inbox = inbound.entry((header.edge as EdgeId, remote)).or_insert_with(Inbox::default);
            if !inbox.try_deliver(remote, bytes) {
                inbox.stash(Bytes::from(bytes.to_vec().into_boxed_slice()));
            }
        }
        ::std::mem::drop(inbound);

        if !active && (frames.staged() > 0 || frames.fill(&mut reader).unwrap_or(0) > 0) {
            panic!("worker {}: clean shutdown from worker {} followed by data", local, remote);
        }
    }

    logger.as_mut().map(|l| l.log(StateEvent { send: false, remote: Some(remote), start: false }));
}

/// Writes frames queued by the worker to `remote`, until the worker drops its sender.
fn send_loop(writer: TcpStream, mut sink: FrameSink, local: WorkerId, remote: WorkerId, mut logger: Option<CommsLogger>) {
    logger.as_mut().map(|l| l.log(StateEvent { send: true, remote: Some(remote), start: true }));

    let mut writer = BufWriter::with_capacity(1 << 16, writer);
    loop {
        let written = sink.write_batch(&mut writer, |header| {
            logger.as_mut().map(|l| l.log(MessageEvent { is_send: true, peer: remote, header: *header }));
        });
        match written {
            Ok(true) => { }
            Ok(false) => break,
            Err(error) => panic!("worker {}: write to worker {} failed: {}", local, remote, error),
        }
    }

    let header = MessageHeader::shutdown();
    header.write_to(&mut writer).expect("Failed to write header!");
    writer.flush().expect("Failed to flush writer.");
    writer.get_mut().shutdown(::std::net::Shutdown::Write).expect("Write shutdown failed");

    logger.as_mut().map(|l| l.log(StateEvent { send: true, remote: Some(remote), start: false }));
}
