//! Outbound byte buffer for one connection.
//!
//! Packets are encoded straight into the buffer; the connection drains it to
//! the socket whenever the socket is writable. A soft limit reports
//! backpressure so callers can shed QoS 0 traffic from slow consumers, and a
//! hard limit stops unbounded growth altogether.

use std::io::{self, Write};

use bytes::{Buf, BytesMut};
use quaymq_core::{encode_packet, Packet};

/// Initial allocation on first write.
const MIN_SIZE: usize = 4096;

/// Hard cap as a multiple of the soft limit.
const HARD_LIMIT_FACTOR: usize = 16;

pub struct WriteBuffer {
    buf: BytesMut,
    soft_limit: usize,
    /// Scratch space reused for encoding.
    scratch: Vec<u8>,
}

impl WriteBuffer {
    /// Create an empty buffer. Nothing is allocated until the first write.
    pub fn new(soft_limit: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            soft_limit: soft_limit.max(MIN_SIZE),
            scratch: Vec::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// True once the pending bytes exceed the soft limit.
    #[inline]
    pub fn is_congested(&self) -> bool {
        self.buf.len() >= self.soft_limit
    }

    fn hard_limit(&self) -> usize {
        self.soft_limit.saturating_mul(HARD_LIMIT_FACTOR)
    }

    /// Append raw bytes.
    ///
    /// Fails with `OutOfMemory` if the hard limit would be exceeded; the
    /// connection treats that as fatal.
    pub fn write_bytes(&mut self, data: &[u8]) -> io::Result<()> {
        if self.buf.len() + data.len() > self.hard_limit() {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "write buffer would exceed maximum size",
            ));
        }
        if self.buf.capacity() == 0 {
            self.buf.reserve(data.len().max(MIN_SIZE));
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Encode a packet into the buffer.
    pub fn push_packet(&mut self, packet: &Packet) -> io::Result<()> {
        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();
        encode_packet(packet, &mut scratch);
        let result = self.write_bytes(&scratch);
        self.scratch = scratch;
        result
    }

    /// Pending bytes, oldest first.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Drop `n` bytes from the front after they were written out.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.buf.len());
        self.buf.advance(n);
        if self.buf.is_empty() && self.buf.capacity() > self.soft_limit {
            // release memory held after a burst
            self.buf = BytesMut::new();
        }
    }

    /// Write as much as `out` accepts. Returns `Ok(true)` once empty,
    /// `Ok(false)` when the writer would block.
    pub fn flush_to<W: Write>(&mut self, out: &mut W) -> io::Result<bool> {
        while !self.buf.is_empty() {
            match out.write(&self.buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "connection closed while writing",
                    ))
                }
                Ok(n) => self.consume(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

impl Write for WriteBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
