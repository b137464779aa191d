use crate::channel::FrameChannel;
use crate::error::{ReliableError, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::Notify;
use tracing::{debug, info};

/// A frame channel on top of a UDP socket that is connected to a single peer. Each frame is
///  one datagram, so there is no channel header.
///
/// UDP has no notion of connection loss: the channel reports `ConnectionClosed` only after it
///  was closed locally.
pub struct UdpFrameChannel {
    socket: UdpSocket,
    mtu: usize,
    closed: AtomicBool,
    close_notify: Notify,
}

impl UdpFrameChannel {
    pub async fn connect(local_addr: SocketAddr, peer_addr: SocketAddr, mtu: usize) -> anyhow::Result<UdpFrameChannel> {
        let socket = UdpSocket::bind(local_addr).await?;
        info!("bound UDP frame channel to {:?}", socket.local_addr()?);
        socket.connect(peer_addr).await?;
        debug!("UDP frame channel connected to {:?}", peer_addr);

        Ok(UdpFrameChannel {
            socket,
            mtu,
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ReliableError::ConnectionClosed);
        }
        Ok(())
    }

    fn check_frame_len(&self, frame: &[u8]) -> Result<()> {
        if frame.len() > self.mtu {
            return Err(ReliableError::FrameTooLarge { len: frame.len(), mtu: self.mtu });
        }
        Ok(())
    }

    fn receive_buf(&self) -> BytesMut {
        BytesMut::zeroed(self.mtu)
    }
}

fn map_io_error(e: std::io::Error) -> ReliableError {
    if e.kind() == ErrorKind::WouldBlock {
        ReliableError::WouldBlock
    }
    else {
        ReliableError::Io(e)
    }
}

#[async_trait]
impl FrameChannel for UdpFrameChannel {
    fn mtu(&self) -> usize {
        self.mtu
    }

    fn header_offset(&self) -> usize {
        0
    }

    async fn send(&self, frame: &[u8]) -> Result<()> {
        self.check_open()?;
        self.check_frame_len(frame)?;
        self.socket.send(frame).await
            .map_err(map_io_error)?;
        Ok(())
    }

    fn try_send(&self, frame: &[u8]) -> Result<()> {
        self.check_open()?;
        self.check_frame_len(frame)?;
        self.socket.try_send(frame)
            .map_err(map_io_error)?;
        Ok(())
    }

    async fn receive(&self) -> Result<Bytes> {
        let closed = self.close_notify.notified();
        tokio::pin!(closed);
        closed.as_mut().enable();
        self.check_open()?;

        let mut buf = self.receive_buf();
        select! {
            result = self.socket.recv(buf.as_mut()) => {
                let num_read = result.map_err(map_io_error)?;
                buf.truncate(num_read);
                Ok(buf.freeze())
            }
            _ = &mut closed => {
                Err(ReliableError::ConnectionClosed)
            }
        }
    }

    fn poll(&self) -> Result<Option<Bytes>> {
        self.check_open()?;

        let mut buf = self.receive_buf();
        match self.socket.try_recv(buf.as_mut()) {
            Ok(num_read) => {
                buf.truncate(num_read);
                Ok(Some(buf.freeze()))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(ReliableError::Io(e)),
        }
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("closing UDP frame channel");
        }
        self.close_notify.notify_waiters();
    }
}
