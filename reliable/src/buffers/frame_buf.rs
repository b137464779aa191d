//! Fixed-capacity buffers for assembling outgoing frames. They are reused aggressively through
//!  [crate::buffers::buffer_pool::BufferPool] to avoid an allocation per frame.
//!
//! There is a single buffer type for all frame channels. Instead of a type per allocator, each
//!  buffer carries a tag for where it came from, and the pool uses that tag to decide whether
//!  a returned buffer is recycled.

use bytes::buf::UninitSlice;
use std::borrow::Borrow;
use std::fmt::{Debug, Formatter};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum BufferOrigin {
    /// taken from a pool, and returned there when it is no longer needed
    Pooled,
    /// allocated for a single use, e.g. because the pool was exhausted or the buffer has a
    ///  non-standard size
    Transient,
}

/// A fixed-length dynamically allocated buffer
#[derive(Eq)]
pub struct FrameBuf {
    buf: Vec<u8>,
    len: usize,
    origin: BufferOrigin,
}
impl FrameBuf {
    pub fn new(capacity: usize, origin: BufferOrigin) -> FrameBuf {
        FrameBuf {
            // buffers are reused, so there is little to gain from lazy initialization
            buf: vec![0; capacity],
            len: 0,
            origin,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn origin(&self) -> BufferOrigin {
        self.origin
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Skip the area that the frame channel reserves for its own header. The skipped bytes
    ///  are zeroed, the channel overwrites them.
    pub fn reserve_header(&mut self, header_offset: usize) {
        assert!(self.len + header_offset <= self.capacity(), "header offset {} exceeds the buffer's capacity", header_offset);
        self.buf[self.len..self.len + header_offset].fill(0);
        self.len += header_offset;
    }

    /// This is a convenience function for test code. It derives the buffer's capacity from the
    ///  slice used for initialization, which is a shortcut not intended for production usage.
    #[cfg(test)]
    pub fn from_slice(data: &[u8]) -> FrameBuf {
        let mut result = FrameBuf::new(data.len(), BufferOrigin::Transient);
        bytes::BufMut::put_slice(&mut result, data);
        result
    }
}

impl PartialEq for FrameBuf {
    fn eq(&self, other: &Self) -> bool {
        self.as_ref().eq(other.as_ref())
    }
}

impl Debug for FrameBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.as_ref().fmt(f)
    }
}

impl Borrow<[u8]> for FrameBuf {
    fn borrow(&self) -> &[u8] {
        self.as_ref()
    }
}

impl AsRef<[u8]> for FrameBuf {
    fn as_ref(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}
impl AsMut<[u8]> for FrameBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }
}

unsafe impl bytes::BufMut for FrameBuf {
    fn remaining_mut(&self) -> usize {
        self.buf.len() - self.len
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        assert!(self.len + cnt <= self.capacity());
        self.len += cnt;
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        UninitSlice::new(&mut self.buf[self.len..])
    }
}
