use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;

pub mod memory;
pub mod udp;

/// This is the abstraction of the unreliable transport underneath the reliability layer. A
///  frame channel connects exactly two peers and transports whole frames of up to `mtu` bytes.
///
/// It may drop, reorder or (rarely) duplicate frames, but it must never deliver a partial or
///  corrupted frame. Concrete implementations are chosen by the application and passed in when
///  a connection is opened.
///
/// Each frame starts with `header_offset` bytes reserved for the channel's own use. The
///  reliability layer leaves them zeroed when sending, and skips them when receiving.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FrameChannel: Send + Sync + 'static {
    fn mtu(&self) -> usize;

    fn header_offset(&self) -> usize;

    /// Send a frame, waiting while the channel applies backpressure
    async fn send(&self, frame: &[u8]) -> Result<()>;

    /// Send a frame if that is possible without waiting, failing with `WouldBlock` otherwise
    fn try_send(&self, frame: &[u8]) -> Result<()>;

    /// Wait for the next frame. Fails with `ConnectionClosed` once the channel is closed.
    async fn receive(&self) -> Result<Bytes>;

    /// Return the next frame if one is available without waiting
    fn poll(&self) -> Result<Option<Bytes>>;

    async fn close(&self);
}
