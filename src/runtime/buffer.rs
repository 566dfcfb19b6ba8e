//! Transfer buffers for moving bytes between a stream and a relay target.
//!
//! A `TransferBuffer` is a fixed-capacity staging area with a position and
//! a limit. It alternates between two modes:
//!
//! - **fill mode** (after `clear`): position is the next byte to fill,
//!   limit equals capacity. Reads land in `[position, limit)`.
//! - **drain mode** (after `flip`): position is the next byte to send,
//!   limit is the number of bytes that were filled. Writes take
//!   `[position, limit)`.
//!
//! Reading while in drain mode or writing while in fill mode corrupts the
//! byte stream, so both directions are checked in debug builds.
//!
//! ## Buffer Pool
//!
//! `BufferPool` recycles transfer buffers across connections without
//! per-connection allocation on the hot path. Every buffer handed out is
//! cleared, so no position or limit leaks from one connection to the next.

use bytes::Buf;
use std::io::{self, Read, Write};

/// Fixed-capacity byte staging area with position/limit bookkeeping.
#[derive(Debug)]
pub struct TransferBuffer {
    data: Box<[u8]>,
    position: usize,
    limit: usize,
    draining: bool,
}

impl TransferBuffer {
    /// Create a buffer in fill mode.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            position: 0,
            limit: capacity,
            draining: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Bytes between position and limit.
    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    pub fn has_remaining(&self) -> bool {
        self.position < self.limit
    }

    /// True once `flip` has been called and until the next `clear`.
    #[cfg(test)]
    pub fn is_draining(&self) -> bool {
        self.draining
    }

    /// Switch to drain mode: limit becomes the fill level, position rewinds.
    pub fn flip(&mut self) {
        debug_assert!(!self.draining, "flip on a buffer already in drain mode");
        self.limit = self.position;
        self.position = 0;
        self.draining = true;
    }

    /// Switch back to fill mode, discarding any unsent bytes.
    pub fn clear(&mut self) {
        self.position = 0;
        self.limit = self.data.len();
        self.draining = false;
    }

    /// Perform one read from `source` into the unfilled region.
    ///
    /// Returns `Ok(0)` at end-of-stream (or when the buffer is already full).
    pub fn read_from<R: Read + ?Sized>(&mut self, source: &mut R) -> io::Result<usize> {
        debug_assert!(!self.draining, "read into a buffer in drain mode");
        let n = source.read(&mut self.data[self.position..self.limit])?;
        self.position += n;
        Ok(n)
    }

    /// Perform one write of the unsent region to `sink`.
    pub fn write_to<W: Write + ?Sized>(&mut self, sink: &mut W) -> io::Result<usize> {
        debug_assert!(self.draining, "write from a buffer in fill mode");
        let n = sink.write(&self.data[self.position..self.limit])?;
        self.position += n;
        Ok(n)
    }

    /// Copy as much of `src` as fits into the unfilled region.
    pub fn put_slice(&mut self, src: &[u8]) -> usize {
        debug_assert!(!self.draining, "put into a buffer in drain mode");
        let n = src.len().min(self.remaining());
        self.data[self.position..self.position + n].copy_from_slice(&src[..n]);
        self.position += n;
        n
    }
}

impl Buf for TransferBuffer {
    fn remaining(&self) -> usize {
        TransferBuffer::remaining(self)
    }

    fn chunk(&self) -> &[u8] {
        &self.data[self.position..self.limit]
    }

    fn advance(&mut self, cnt: usize) {
        assert!(
            cnt <= TransferBuffer::remaining(self),
            "advance past limit: {cnt} > {}",
            TransferBuffer::remaining(self)
        );
        self.position += cnt;
    }
}

/// Recycling pool of equally sized transfer buffers.
///
/// Buffers are allocated lazily and kept for reuse up to `max_idle`.
pub struct BufferPool {
    /// Idle buffers, all in fill mode (LIFO for cache locality).
    free_list: Vec<TransferBuffer>,
    /// Capacity of each buffer.
    buffer_size: usize,
    /// Upper bound on idle buffers retained.
    max_idle: usize,
}

impl BufferPool {
    /// Create an empty pool.
    ///
    /// # Arguments
    /// * `max_idle` - Number of released buffers kept for reuse
    /// * `size` - Capacity of each buffer in bytes
    pub fn new(max_idle: usize, size: usize) -> Self {
        Self {
            free_list: Vec::with_capacity(max_idle.min(1024)),
            buffer_size: size,
            max_idle,
        }
    }

    /// Take a cleared buffer, reusing an idle one when available.
    pub fn acquire(&mut self) -> TransferBuffer {
        self.free_list
            .pop()
            .unwrap_or_else(|| TransferBuffer::new(self.buffer_size))
    }

    /// Return a buffer to the pool. Its state is reset before reuse.
    pub fn release(&mut self, mut buffer: TransferBuffer) {
        if self.free_list.len() >= self.max_idle || buffer.capacity() != self.buffer_size {
            return;
        }
        buffer.clear();
        self.free_list.push(buffer);
    }

    /// Number of idle buffers ready for reuse.
    #[cfg(test)]
    pub fn available(&self) -> usize {
        self.free_list.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Writer that accepts at most `max` bytes per call.
    struct Trickle {
        out: Vec<u8>,
        max: usize,
    }

    impl Write for Trickle {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = buf.len().min(self.max);
            self.out.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_flip_and_clear() {
        let mut buf = TransferBuffer::new(16);
        assert_eq!(buf.position(), 0);
        assert_eq!(buf.limit(), 16);

        assert_eq!(buf.put_slice(b"ping"), 4);
        assert_eq!(buf.position(), 4);

        buf.flip();
        assert!(buf.is_draining());
        assert_eq!(buf.position(), 0);
        assert_eq!(buf.limit(), 4);
        assert_eq!(buf.chunk(), b"ping");

        buf.clear();
        assert!(!buf.is_draining());
        assert_eq!(buf.position(), 0);
        assert_eq!(buf.limit(), 16);
    }

    #[test]
    fn test_limit_matches_bytes_read() {
        let mut buf = TransferBuffer::new(8);
        let mut source = Cursor::new(b"hello world".to_vec());

        let n = buf.read_from(&mut source).unwrap();
        assert_eq!(n, 8);
        buf.flip();
        assert_eq!(buf.limit(), n);
        assert_eq!(buf.chunk(), b"hello wo");

        buf.clear();
        let n = buf.read_from(&mut source).unwrap();
        assert_eq!(n, 3);
        buf.flip();
        assert_eq!(buf.limit(), 3);
        assert_eq!(buf.chunk(), b"rld");

        // Source exhausted
        buf.clear();
        assert_eq!(buf.read_from(&mut source).unwrap(), 0);
    }

    #[test]
    fn test_partial_write_keeps_unsent_bytes() {
        let mut buf = TransferBuffer::new(16);
        buf.put_slice(b"abcdefgh");
        buf.flip();

        let mut sink = Trickle {
            out: Vec::new(),
            max: 3,
        };
        assert_eq!(buf.write_to(&mut sink).unwrap(), 3);
        assert_eq!(buf.position(), 3);
        assert_eq!(buf.remaining(), 5);

        while buf.has_remaining() {
            buf.write_to(&mut sink).unwrap();
        }
        assert_eq!(sink.out, b"abcdefgh");
    }

    #[test]
    fn test_put_slice_truncates_to_capacity() {
        let mut buf = TransferBuffer::new(4);
        assert_eq!(buf.put_slice(b"received"), 4);
        buf.flip();
        assert_eq!(buf.chunk(), b"rece");
    }

    #[test]
    fn test_buf_advance() {
        let mut buf = TransferBuffer::new(8);
        buf.put_slice(b"abcdef");
        buf.flip();
        buf.advance(2);
        assert_eq!(buf.chunk(), b"cdef");
        assert_eq!(Buf::remaining(&buf), 4);
    }

    #[test]
    fn test_pool_reuse_resets_state() {
        let mut pool = BufferPool::new(2, 32);
        assert_eq!(pool.available(), 0);

        let mut first = pool.acquire();
        first.put_slice(b"leftover");
        first.flip();
        first.advance(3);
        pool.release(first);
        assert_eq!(pool.available(), 1);

        let second = pool.acquire();
        assert_eq!(second.position(), 0);
        assert_eq!(second.limit(), 32);
        assert!(!second.is_draining());
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_pool_bounds_idle_buffers() {
        let mut pool = BufferPool::new(1, 8);
        let a = pool.acquire();
        let b = pool.acquire();
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.available(), 1);

        // Foreign sizes are not retained
        pool.acquire();
        pool.release(TransferBuffer::new(4));
        assert_eq!(pool.available(), 0);
    }
}
