//! Growable circular byte queue with close semantics.
//!
//! One producer thread and one consumer thread may act on a [`FifoBuffer`]
//! simultaneously. The producer side blocks when the buffer is full; the
//! consumer side never blocks. Closing is idempotent and safe from either
//! side, and wakes every waiter.
//!
//! The buffer also acts as a pump between non-blocking endpoints:
//! [`FifoBuffer::receive`] pulls bytes out of a readiness-driven source and
//! [`FifoBuffer::send`] pushes readable bytes into a readiness-driven sink,
//! both stopping at would-block instead of suspending.

use std::io::{self, Read, Write};

use parking_lot::{Condvar, Mutex};

/// Error returned by [`FifoBuffer::write`] when the buffer was closed
/// before or while the producer waited for space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("fifo buffer closed")]
pub struct FifoClosed;

/// Bounded, growable SPSC byte queue.
///
/// Capacity starts at `initial` bytes and grows geometrically on demand up
/// to `limit`; it never shrinks. `readable() + writable()` never exceeds
/// `limit`.
pub struct FifoBuffer {
    limit: usize,
    inner: Mutex<Ring>,
    not_empty: Condvar,
    not_full: Condvar,
}

struct Ring {
    buf: Box<[u8]>,
    /// Index of the first readable byte.
    head: usize,
    /// Number of readable bytes.
    len: usize,
    closed: bool,
}

impl Ring {
    fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn free(&self) -> usize {
        self.capacity() - self.len
    }

    fn tail(&self) -> usize {
        (self.head + self.len) % self.capacity()
    }

    /// Contiguous free region starting at the tail. Caller ensures `free() > 0`.
    fn free_segment(&self) -> (usize, usize) {
        let tail = self.tail();
        (tail, self.free().min(self.capacity() - tail))
    }

    /// Contiguous readable region starting at the head. Caller ensures `len > 0`.
    fn readable_segment(&self) -> (usize, usize) {
        (self.head, self.len.min(self.capacity() - self.head))
    }

    /// Reallocate to the next geometric step, clamped to `limit`.
    fn grow(&mut self, limit: usize) {
        let new_cap = (self.capacity() * 2).clamp(self.capacity() + 1, limit);
        let mut next = vec![0u8; new_cap].into_boxed_slice();
        let n = self.copy_out(0, &mut next[..self.len]);
        debug_assert_eq!(n, self.len);
        self.buf = next;
        self.head = 0;
    }

    /// Copy up to `dst.len()` readable bytes starting `offset` past the
    /// head, without consuming. Returns the number of bytes copied.
    fn copy_out(&self, offset: usize, dst: &mut [u8]) -> usize {
        let avail = self.len.saturating_sub(offset);
        let n = dst.len().min(avail);
        let cap = self.capacity();
        let start = (self.head + offset) % cap;
        let first = n.min(cap - start);
        dst[..first].copy_from_slice(&self.buf[start..start + first]);
        if first < n {
            dst[first..n].copy_from_slice(&self.buf[..n - first]);
        }
        n
    }

    /// Append `src` at the tail. Caller ensures `src.len() <= free()`.
    fn push(&mut self, src: &[u8]) {
        let cap = self.capacity();
        let tail = self.tail();
        let first = src.len().min(cap - tail);
        self.buf[tail..tail + first].copy_from_slice(&src[..first]);
        if first < src.len() {
            self.buf[..src.len() - first].copy_from_slice(&src[first..]);
        }
        self.len += src.len();
    }

    /// Drop `n` bytes from the head. Caller ensures `n <= len`.
    fn consume(&mut self, n: usize) {
        self.head = (self.head + n) % self.capacity();
        self.len -= n;
    }
}

impl FifoBuffer {
    /// Create a buffer with `initial` bytes of capacity and a hard cap of
    /// `limit` bytes.
    pub fn new(initial: usize, limit: usize) -> Self {
        let initial = initial.clamp(1, limit);
        Self {
            limit,
            inner: Mutex::new(Ring {
                buf: vec![0u8; initial].into_boxed_slice(),
                head: 0,
                len: 0,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Number of readable bytes, or `-1` once the buffer is closed and
    /// fully drained (the consumer-side EOF signal).
    pub fn readable(&self) -> isize {
        let inner = self.inner.lock();
        if inner.len == 0 && inner.closed {
            -1
        } else {
            inner.len as isize
        }
    }

    /// Bytes the producer may still queue before blocking, counting room
    /// the buffer could still grow into. Zero once closed.
    pub fn writable(&self) -> usize {
        let inner = self.inner.lock();
        if inner.closed {
            0
        } else {
            self.limit - inner.len
        }
    }

    /// True when the buffer holds `limit` readable bytes and cannot accept
    /// another byte no matter how far it grows.
    pub fn at_limit(&self) -> bool {
        self.inner.lock().len == self.limit
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Append all of `data`, blocking while the buffer is full.
    ///
    /// Fails with [`FifoClosed`] if the buffer was closed before or during
    /// the wait; bytes already appended stay queued for the consumer.
    pub fn write(&self, mut data: &[u8]) -> Result<(), FifoClosed> {
        let mut inner = self.inner.lock();
        while !data.is_empty() {
            if inner.closed {
                return Err(FifoClosed);
            }
            if inner.free() == 0 {
                if inner.capacity() < self.limit {
                    inner.grow(self.limit);
                } else {
                    self.not_full.wait(&mut inner);
                    continue;
                }
            }
            let n = data.len().min(inner.free());
            inner.push(&data[..n]);
            data = &data[n..];
            self.not_empty.notify_one();
        }
        Ok(())
    }

    /// Copy up to `dst.len()` bytes out of the buffer, consuming them.
    /// Returns the number copied, possibly zero. Never blocks.
    pub fn read_non_blocking(&self, dst: &mut [u8]) -> usize {
        let mut inner = self.inner.lock();
        let n = inner.copy_out(0, dst);
        if n > 0 {
            inner.consume(n);
            self.not_full.notify_one();
        }
        n
    }

    /// Copy up to `dst.len()` bytes starting `offset` bytes past the head,
    /// without consuming anything. Returns the number copied (zero when not
    /// enough bytes are buffered). Repeated calls observe identical bytes.
    pub fn peek(&self, offset: usize, dst: &mut [u8]) -> usize {
        self.inner.lock().copy_out(offset, dst)
    }

    /// Pull bytes from a non-blocking source into the free region, growing
    /// on demand, until the source would block, reports EOF, or the buffer
    /// sits full at its hard cap.
    ///
    /// Returns the number of bytes moved, or `-1` when the source reported
    /// EOF before any byte moved this call. Never blocks.
    pub fn receive<R: Read + ?Sized>(&self, src: &mut R) -> io::Result<isize> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(-1);
        }
        let mut total: isize = 0;
        loop {
            if inner.free() == 0 {
                if inner.capacity() < self.limit {
                    inner.grow(self.limit);
                } else {
                    break;
                }
            }
            let (start, seg) = inner.free_segment();
            match src.read(&mut inner.buf[start..start + seg]) {
                Ok(0) => {
                    if total == 0 {
                        return Ok(-1);
                    }
                    break;
                }
                Ok(n) => {
                    inner.len += n;
                    total += n as isize;
                    self.not_empty.notify_one();
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Push readable bytes into a non-blocking sink until it would block or
    /// the buffer is empty.
    ///
    /// Returns the number of bytes written, or `-1` once the buffer is
    /// closed and fully drained, at which point the caller may half-close
    /// the sink. Never blocks.
    pub fn send<W: Write + ?Sized>(&self, dst: &mut W) -> io::Result<isize> {
        let mut inner = self.inner.lock();
        let mut total: isize = 0;
        while inner.len > 0 {
            let (start, seg) = inner.readable_segment();
            match dst.write(&inner.buf[start..start + seg]) {
                Ok(0) => break,
                Ok(n) => {
                    inner.consume(n);
                    total += n as isize;
                    self.not_full.notify_one();
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        if inner.closed && inner.len == 0 {
            return Ok(-1);
        }
        Ok(total)
    }

    /// Mark the buffer closed and wake every waiter. Idempotent. Remaining
    /// bytes stay readable; further producer writes fail.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}
