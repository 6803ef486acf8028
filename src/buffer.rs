//! Fixed-size byte buffers and the pools recycling them.
//!
//! Buffers are allocated once when an operation starts and move between a free pool, the
//! in-flight send table, the transport (posted for receiving) and in-flight receive messages.
//! A buffer is owned by exactly one of these at a time.

use crate::error::{CommsError, Result};

/// A fixed-capacity byte region with a count of valid bytes.
#[derive(Debug)]
pub struct DataBuffer {
    data: Box<[u8]>,
    size: usize,
}

impl DataBuffer {
    /// Allocates a zeroed buffer of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        DataBuffer {
            data: vec![0u8; capacity].into_boxed_slice(),
            size: 0,
        }
    }

    /// Total bytes the buffer can hold.
    pub fn capacity(&self) -> usize { self.data.len() }
    /// Bytes written so far.
    pub fn size(&self) -> usize { self.size }
    /// Bytes that can still be written.
    pub fn remaining(&self) -> usize { self.data.len() - self.size }

    /// Appends as much of `bytes` as fits, returning the number of bytes written.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        let count = bytes.len().min(self.remaining());
        self.data[self.size .. self.size + count].copy_from_slice(&bytes[..count]);
        self.size += count;
        count
    }

    /// Replaces the contents with `bytes`; false if they do not fit.
    pub fn fill_from(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.data.len() {
            return false;
        }
        self.data[..bytes.len()].copy_from_slice(bytes);
        self.size = bytes.len();
        true
    }

    /// Marks the first `size` bytes as written.
    pub fn set_size(&mut self, size: usize) {
        assert!(size <= self.data.len(), "size {} beyond capacity {}", size, self.data.len());
        self.size = size;
    }

    /// The written bytes.
    pub fn as_slice(&self) -> &[u8] { &self.data[..self.size] }
    /// The written bytes, mutably.
    pub fn as_mut_slice(&mut self) -> &mut [u8] { &mut self.data[..self.size] }

    /// Forgets the contents.
    pub fn reset(&mut self) {
        self.size = 0;
    }
}

/// A bounded pool of free buffers.
///
/// Acquisition never blocks; an empty pool means "cannot progress now". Releasing into a pool
/// that already holds every buffer it was created with is an accounting error.
#[derive(Debug)]
pub struct BufferPool {
    name: &'static str,
    free: Vec<DataBuffer>,
    capacity: usize,
}

impl BufferPool {
    /// An empty pool that will accept up to `capacity` buffers.
    pub fn new(name: &'static str, capacity: usize) -> Self {
        BufferPool { name, free: Vec::with_capacity(capacity), capacity }
    }

    /// A full pool owning `buffers`.
    pub fn with_buffers(name: &'static str, buffers: Vec<DataBuffer>) -> Self {
        let capacity = buffers.len();
        BufferPool { name, free: buffers, capacity }
    }

    /// Takes a free buffer, if any.
    pub fn acquire(&mut self) -> Option<DataBuffer> {
        self.free.pop()
    }

    /// Resets `buffer` and returns it to the pool.
    pub fn release(&mut self, mut buffer: DataBuffer) -> Result<()> {
        if self.free.len() >= self.capacity {
            return Err(CommsError::BufferPoolOverflow { pool: self.name });
        }
        buffer.reset();
        self.free.push(buffer);
        Ok(())
    }

    /// Buffers currently free.
    pub fn available(&self) -> usize { self.free.len() }
    /// Buffers the pool was created for.
    pub fn capacity(&self) -> usize { self.capacity }
    /// Name of the pool family.
    pub fn name(&self) -> &'static str { self.name }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_are_bounded_by_capacity() {
        let mut buffer = DataBuffer::new(8);
        assert_eq!(buffer.write(&[1, 2, 3]), 3);
        assert_eq!(buffer.write(&[4, 5, 6, 7, 8, 9, 10]), 5);
        assert_eq!(buffer.remaining(), 0);
        assert_eq!(buffer.as_slice(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(!buffer.fill_from(&[0; 9]));
        assert!(buffer.fill_from(&[9, 9]));
        assert_eq!(buffer.as_slice(), &[9, 9]);
    }

    #[test]
    fn pool_rejects_overflow() {
        let mut pool = BufferPool::with_buffers("send", vec![DataBuffer::new(4), DataBuffer::new(4)]);
        let mut first = pool.acquire().unwrap();
        let second = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());

        first.write(&[1, 2]);
        pool.release(first).unwrap();
        assert_eq!(pool.acquire().unwrap().size(), 0);

        pool.release(second).unwrap();
        pool.release(DataBuffer::new(4)).unwrap();
        match pool.release(DataBuffer::new(4)) {
            Err(CommsError::BufferPoolOverflow { pool }) => assert_eq!(pool, "send"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
