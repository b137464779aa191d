//! An in-process frame channel. Its two ends are connected through bounded queues, and it can
//!  be configured to drop, duplicate and reorder frames at random, which makes it the
//!  channel of choice for testing and for demonstrating the reliability layer.

use crate::channel::FrameChannel;
use crate::error::{ReliableError, Result};
use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Probabilities of impairments, applied independently to every frame
#[derive(Clone, Debug, PartialEq)]
pub struct LinkImpairment {
    pub drop_probability: f64,
    pub duplicate_probability: f64,
    /// a reordered frame is inserted at a random position among the frames waiting to be
    ///  received rather than at the end
    pub reorder_probability: f64,
}

impl LinkImpairment {
    pub const NONE: LinkImpairment = LinkImpairment {
        drop_probability: 0.0,
        duplicate_probability: 0.0,
        reorder_probability: 0.0,
    };
}

#[derive(Clone, Debug)]
pub struct MemoryChannelConfig {
    pub mtu: usize,
    pub header_offset: usize,
    /// number of frames that can be queued per direction before `send` waits
    pub capacity: usize,
    pub impairment: LinkImpairment,
    pub seed: u64,
}

impl Default for MemoryChannelConfig {
    fn default() -> Self {
        MemoryChannelConfig {
            mtu: 1500,
            header_offset: 0,
            capacity: 1024,
            impairment: LinkImpairment::NONE,
            seed: 0,
        }
    }
}

impl MemoryChannelConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.header_offset >= self.mtu {
            bail!("header offset {} leaves no room in an MTU of {}", self.header_offset, self.mtu);
        }
        if self.capacity == 0 {
            bail!("capacity must be at least 1");
        }
        for (name, p) in [
            ("drop", self.impairment.drop_probability),
            ("duplicate", self.impairment.duplicate_probability),
            ("reorder", self.impairment.reorder_probability),
        ] {
            if !(0.0..=1.0).contains(&p) {
                bail!("{} probability {} is not in [0, 1]", name, p);
            }
        }
        Ok(())
    }
}

/// One direction of the channel
#[derive(Default)]
struct Link {
    frames: Mutex<VecDeque<Bytes>>,
    frame_available: Notify,
    space_available: Notify,
}

pub struct MemoryChannel {
    config: Arc<MemoryChannelConfig>,
    outgoing: Arc<Link>,
    incoming: Arc<Link>,
    /// shared by both ends: closing either end closes the channel
    closed: Arc<AtomicBool>,
    rng: Mutex<StdRng>,
}

impl MemoryChannel {
    /// Create a connected pair of channel ends - this plays the role of connect / accept for
    ///  real transports
    pub fn pair(config: MemoryChannelConfig) -> anyhow::Result<(MemoryChannel, MemoryChannel)> {
        config.validate()?;

        let config = Arc::new(config);
        let a_to_b = Arc::new(Link::default());
        let b_to_a = Arc::new(Link::default());
        let closed = Arc::new(AtomicBool::new(false));

        let a = MemoryChannel {
            config: config.clone(),
            outgoing: a_to_b.clone(),
            incoming: b_to_a.clone(),
            closed: closed.clone(),
            rng: Mutex::new(StdRng::seed_from_u64(config.seed)),
        };
        let b = MemoryChannel {
            config: config.clone(),
            outgoing: b_to_a,
            incoming: a_to_b,
            closed,
            rng: Mutex::new(StdRng::seed_from_u64(config.seed.wrapping_add(1))),
        };
        Ok((a, b))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl FrameChannel for MemoryChannel {
    fn mtu(&self) -> usize {
        self.config.mtu
    }

    fn header_offset(&self) -> usize {
        self.config.header_offset
    }

    async fn send(&self, frame: &[u8]) -> Result<()> {
        loop {
            let space_available = self.outgoing.space_available.notified();
            tokio::pin!(space_available);
            space_available.as_mut().enable();

            match self.try_send(frame) {
                Err(ReliableError::WouldBlock) => {
                    trace!("memory channel is full - waiting");
                }
                other => return other,
            }

            space_available.await;
        }
    }

    fn try_send(&self, frame: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(ReliableError::ConnectionClosed);
        }
        if frame.len() > self.config.mtu {
            return Err(ReliableError::FrameTooLarge { len: frame.len(), mtu: self.config.mtu });
        }

        let mut frames = self.outgoing.frames.lock().unwrap_or_else(PoisonError::into_inner);
        if frames.len() >= self.config.capacity {
            return Err(ReliableError::WouldBlock);
        }

        let impairment = &self.config.impairment;
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        if rng.gen_bool(impairment.drop_probability) {
            debug!("memory channel: dropping frame of {} bytes", frame.len());
            return Ok(());
        }

        let frame = Bytes::copy_from_slice(frame);
        if !frames.is_empty() && rng.gen_bool(impairment.reorder_probability) {
            let pos = rng.gen_range(0..frames.len());
            trace!("memory channel: reordering frame to position {} of {}", pos, frames.len());
            frames.insert(pos, frame.clone());
        }
        else {
            frames.push_back(frame.clone());
        }
        if rng.gen_bool(impairment.duplicate_probability) {
            trace!("memory channel: duplicating frame");
            frames.push_back(frame);
        }
        drop(frames);

        self.outgoing.frame_available.notify_waiters();
        Ok(())
    }

    async fn receive(&self) -> Result<Bytes> {
        loop {
            let frame_available = self.incoming.frame_available.notified();
            tokio::pin!(frame_available);
            frame_available.as_mut().enable();

            if let Some(frame) = self.poll()? {
                return Ok(frame);
            }

            frame_available.await;
        }
    }

    fn poll(&self) -> Result<Option<Bytes>> {
        if self.is_closed() {
            return Err(ReliableError::ConnectionClosed);
        }

        let frame = self.incoming.frames.lock().unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        if frame.is_some() {
            self.incoming.space_available.notify_waiters();
        }
        Ok(frame)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("closing memory channel");
        }
        for link in [&self.outgoing, &self.incoming] {
            link.frame_available.notify_waiters();
            link.space_available.notify_waiters();
        }
    }
}
