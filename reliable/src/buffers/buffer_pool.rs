use crate::buffers::frame_buf::{BufferOrigin, FrameBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, trace, warn};

/// A pool of frame buffers, all with a capacity of one MTU. Buffers are taken from the pool
///  to assemble a frame and returned after the frame was handed to the frame channel.
pub struct BufferPool {
    buf_size: usize,
    max_pool_size: usize,
    buffers: Mutex<Vec<FrameBuf>>,
}

impl BufferPool {
    pub fn new(buf_size: usize, max_pool_size: usize) -> Self {
        BufferPool {
            buf_size,
            max_pool_size,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    pub fn get_from_pool(&self) -> FrameBuf {
        {
            let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(buffer) = buffers.pop() {
                trace!("returning buffer from pool");
                return buffer;
            }
        }

        debug!("no buffer in pool: creating new buffer");
        FrameBuf::new(self.buf_size, BufferOrigin::Pooled)
    }

    pub fn return_to_pool(&self, mut buffer: FrameBuf) {
        if buffer.origin() == BufferOrigin::Transient {
            trace!("discarding transient buffer");
            return;
        }
        if buffer.capacity() != self.buf_size {
            warn!("returned buffer has a capacity of {} bytes instead of the pool's {} - discarding", buffer.capacity(), self.buf_size);
            return;
        }

        buffer.clear();

        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        if buffers.len() < self.max_pool_size {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }

    #[cfg(test)]
    fn num_pooled(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }
}
