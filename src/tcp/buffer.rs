//! Side-buffers: chunked byte stores bridging the user's byte stream and the
//! wire's sequence-numbered segments (spec S2 item 2, S3, S4.1).
//!
//! A side-buffer is logically a flat byte stream with a write cursor
//! (`snd_nxt + snd_user` for TX, the receive-window's right edge for RX) and
//! a drain cursor (`snd_una` for TX, `rcv_nxt` for RX). The teacher stores
//! this as a single `VecDeque<u8>`; we keep that representation — it *is*
//! the logical-byte-stream abstraction described in spec.md S3 — and layer
//! the chunk-count bookkeeping spec.md S4.1 describes on top of it, the way
//! a fixed-size chunk-descriptor array would if tracked separately.

use std::collections::VecDeque;

use crate::config::MAX_CHUNK_COUNT;
use crate::err::TcpError;

#[derive(Debug)]
pub struct SideBuffer {
    data: VecDeque<u8>,
    capacity: usize,
    chunk_size: usize,
}

impl SideBuffer {
    /// Materializes a side-buffer of `capacity` bytes. Fails with
    /// `OUT_OF_RESOURCES` if `capacity` cannot be serviced by at most
    /// `MAX_CHUNK_COUNT` chunks at a sane minimum chunk size, mirroring the
    /// `max_chunks = floor(sizeof(chunk_array) / sizeof(chunk_element))`
    /// computation of spec.md S4.1.
    pub fn allocate(capacity: usize) -> Result<Self, TcpError> {
        if capacity == 0 {
            return Err(TcpError::OutOfResources);
        }

        let chunk_size = capacity.div_ceil(MAX_CHUNK_COUNT);
        if chunk_size == 0 {
            return Err(TcpError::OutOfResources);
        }

        Ok(SideBuffer {
            data: VecDeque::with_capacity(capacity),
            capacity,
            chunk_size,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn free(&self) -> usize {
        self.capacity - self.data.len()
    }

    /// Number of chunk descriptors currently needed to cover the occupied
    /// region; always `<= MAX_CHUNK_COUNT`.
    pub fn chunk_count(&self) -> usize {
        std::cmp::min(
            self.data.len().div_ceil(self.chunk_size).max(1),
            MAX_CHUNK_COUNT,
        )
    }

    /// Appends up to `free()` bytes from `data`, returning the amount copied.
    pub fn push(&mut self, data: &[u8]) -> usize {
        let n = std::cmp::min(data.len(), self.free());
        self.data.extend(data[..n].iter());
        n
    }

    /// Copies up to `buf.len()` bytes out without removing them (used by the
    /// retransmission path, which must be able to resend unacked bytes).
    pub fn peek(&self, skip: usize, buf: &mut Vec<u8>, max_len: usize) {
        buf.clear();
        buf.extend(self.data.iter().skip(skip).take(max_len));
    }

    /// Removes the first `n` bytes (acknowledged or consumed data).
    pub fn drain_front(&mut self, n: usize) {
        let n = std::cmp::min(n, self.data.len());
        self.data.drain(..n);
    }

    /// Copies up to `buf.len()` bytes out of the front of the buffer,
    /// removing them, and returns how many were copied.
    pub fn drain_into(&mut self, buf: &mut [u8]) -> usize {
        let n = std::cmp::min(buf.len(), self.data.len());
        for (slot, byte) in buf[..n].iter_mut().zip(self.data.drain(..n)) {
            *slot = byte;
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_respects_chunk_budget() {
        let buf = SideBuffer::allocate(1000).unwrap();
        assert!(buf.chunk_count() <= MAX_CHUNK_COUNT);
        assert_eq!(buf.capacity(), 1000);
        assert_eq!(buf.free(), 1000);
    }

    #[test]
    fn allocate_zero_fails() {
        assert_eq!(SideBuffer::allocate(0).unwrap_err(), TcpError::OutOfResources);
    }

    #[test]
    fn push_bounded_by_free_space() {
        let mut buf = SideBuffer::allocate(4).unwrap();
        assert_eq!(buf.push(&[1, 2, 3, 4, 5]), 4);
        assert_eq!(buf.free(), 0);
        assert_eq!(buf.push(&[6]), 0);
    }

    #[test]
    fn drain_front_removes_oldest_bytes() {
        let mut buf = SideBuffer::allocate(8).unwrap();
        buf.push(&[1, 2, 3, 4]);
        buf.drain_front(2);
        assert_eq!(buf.len(), 2);

        let mut out = vec![0u8; 2];
        buf.peek(0, &mut out, 2);
        assert_eq!(out, vec![3, 4]);
    }
}
