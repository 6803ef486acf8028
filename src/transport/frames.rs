//! Chunks framed back to back on a byte stream.
//!
//! Every chunk starts with its [`MessageHeader`], whose `length` gives the payload bytes that
//! follow, so a chunk is exactly one frame. Outgoing frames are copied into recycled vectors and
//! queued for the send thread of the connection; incoming bytes are read into one staging area
//! from which complete frames are sliced and copied straight into posted receive buffers.

use std::io::{self, Read, Write};

use crossbeam_channel::{Receiver, Sender};

use crate::header::{MessageHeader, HEADER_SIZE};

/// The worker's end of a connection's outgoing frames.
pub struct FrameSender {
    frames: Sender<Vec<u8>>,
    spare: Receiver<Vec<u8>>,
}

impl FrameSender {
    /// Queues a copy of `frame`; false once the send thread is gone.
    pub fn send(&self, frame: &[u8]) -> bool {
        let mut copy = self.spare.try_recv().unwrap_or_default();
        copy.clear();
        copy.extend_from_slice(frame);
        self.frames.send(copy).is_ok()
    }
}

/// The send thread's end of a connection's outgoing frames.
pub struct FrameSink {
    frames: Receiver<Vec<u8>>,
    spare: Sender<Vec<u8>>,
}

impl FrameSink {
    /// Waits for frames and writes every queued one to `writer`, then flushes it.
    ///
    /// `observe` sees the header of each written frame. Returns `Ok(false)` once the
    /// [`FrameSender`] was dropped and every frame was written.
    pub fn write_batch<W: Write, F: FnMut(&MessageHeader)>(&mut self, writer: &mut W, mut observe: F) -> io::Result<bool> {
        let first = match self.frames.recv() {
            Ok(frame) => frame,
            Err(_) => return Ok(false),
        };
        let mut next = Some(first);
        while let Some(frame) = next {
            if let Some(header) = MessageHeader::try_read(&frame) {
                observe(&header);
            }
            writer.write_all(&frame)?;
            // a full pool, or a departed worker, lets the vector drop.
            self.spare.try_send(frame).ok();
            next = self.frames.try_recv().ok();
        }
        writer.flush()?;
        Ok(true)
    }
}

/// Outgoing frames of one connection, keeping up to `spares` vectors for reuse.
pub fn frame_channel(spares: usize) -> (FrameSender, FrameSink) {
    let (frames_in, frames_out) = crossbeam_channel::unbounded();
    let (spare_in, spare_out) = crossbeam_channel::bounded(spares);
    (FrameSender { frames: frames_in, spare: spare_out }, FrameSink { frames: frames_out, spare: spare_in })
}

/// Incoming bytes of one connection, cut into frames.
pub struct FrameReader {
    staged: Vec<u8>,
    start: usize,
    end: usize,
}

impl FrameReader {
    /// A reader staging up to `capacity` bytes before it has to grow.
    pub fn new(capacity: usize) -> Self {
        FrameReader { staged: vec![0u8; capacity.max(HEADER_SIZE)], start: 0, end: 0 }
    }

    /// Reads once from `reader`, returning the number of bytes read; 0 at the end of the stream.
    ///
    /// Consumed frames are dropped from the front first, and the staging area doubles when a
    /// single frame does not fit.
    pub fn fill<R: Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
        if self.end == self.staged.len() {
            self.staged.copy_within(self.start .. self.end, 0);
            self.end -= self.start;
            self.start = 0;
            if self.end == self.staged.len() {
                let grown = 2 * self.staged.len();
                self.staged.resize(grown, 0);
            }
        }
        let read = reader.read(&mut self.staged[self.end ..])?;
        self.end += read;
        Ok(read)
    }

    /// The next complete frame, header included.
    pub fn next_frame(&mut self) -> Option<(MessageHeader, &[u8])> {
        let header = MessageHeader::try_read(&self.staged[self.start .. self.end])?;
        let frame = self.start .. self.start + header.required_bytes();
        self.start = frame.end;
        Some((header, &self.staged[frame]))
    }

    /// Bytes read but not yet returned as frames.
    pub fn staged(&self) -> usize {
        self.end - self.start
    }
}
