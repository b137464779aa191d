use crate::buffers::buffer_pool::BufferPool;
use crate::channel::FrameChannel;
use crate::config::{EffectiveConnectionConfig, ReliableConfig};
use crate::error::{CloseReason, ReliableError, Result};
use crate::frame_header::{Frame, PiggybackEnvelope};
use crate::piggyback::{AckInbox, PiggybackRegistry, PiggybackSlot};
use crate::receiver::{ReceivedFragment, ReliableReceiver};
use crate::sender::{ReliableSender, SenderSweep};
use crate::sweeper::{SweepOutcome, SweepTarget, Sweeper};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, span, trace, warn, Instrument, Level, Span};
use uuid::Uuid;

/// The results of connection setup that the reliability layer consumes. The handshake itself
///  is the application's business.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ConnectionParams {
    /// the window size agreed on with the peer
    pub window_size: u32,
    /// the partner index that this side allocated (see [PiggybackRegistry::allocate_index]) and
    ///  sent to the peer
    pub local_index: u32,
    /// the partner index the peer allocated for its side of the connection
    pub partner_index: u32,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct ConnectionStats {
    pub num_fragments_sent: u64,
    pub num_retransmits: u64,
    pub num_unacked: usize,
    pub num_fragments_received: u64,
    pub num_duplicates: u64,
    pub num_malformed_frames: u64,
    pub num_malformed_acks: u64,
    pub num_acks_offered: u64,
    pub num_acks_piggybacked: u64,
    pub num_acks_explicit: u64,
    pub num_acks_flushed: u64,
}

struct ConnectionCore {
    id: Uuid,
    span: Span,
    config: Arc<EffectiveConnectionConfig>,
    channel: Arc<dyn FrameChannel>,
    slot: Arc<PiggybackSlot>,
    sender: ReliableSender,
    receiver: ReliableReceiver,
    registry: Arc<PiggybackRegistry>,
    local_index: u32,
    torn_down: AtomicBool,
    /// the application dropped its handle without closing
    abandoned: AtomicBool,
    num_malformed_frames: AtomicU64,
}

impl ConnectionCore {
    async fn on_frame(&self, frame: Bytes) {
        if frame.len() < self.config.header_offset {
            debug!("frame of {} bytes is shorter than the channel header - dropping", frame.len());
            self.num_malformed_frames.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match Frame::parse(frame.slice(self.config.header_offset..)) {
            Ok(Frame::Control(envelope)) => {
                trace!("received explicit ack {:?} for partner index {}", envelope.ack, envelope.partner_index);
                self.registry.dispatch(&envelope);
            }
            Ok(Frame::Data { header, payload }) => {
                self.registry.dispatch(&header.envelope);
                match self.receiver.on_fragment(header.frag_count, payload).await {
                    Some(explicit_ack) => self.send_explicit_ack(explicit_ack).await,
                    // an ack that was left for piggybacking must not wait for the sweeper if
                    //  there is no outgoing traffic
                    None => self.sender.flush_ack_if_idle(),
                }
            }
            Err(e) => {
                debug!("dropping malformed frame: {}", e);
                self.num_malformed_frames.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Send an ack as a control frame. This never waits for the frame channel: if the channel
    ///  applies backpressure, the ack goes back to the piggyback slot.
    async fn send_explicit_ack(&self, envelope: PiggybackEnvelope) {
        match self.sender.send_ack(&envelope) {
            Ok(()) => {
                trace!("sent explicit ack {:?}", envelope.ack);
            }
            Err(ReliableError::ConnectionClosed) => {
                self.teardown(CloseReason::ChannelClosed).await;
            }
            Err(e) => {
                trace!("sending explicit ack failed: {} - leaving it for the next data frame or sweep", e);
                self.slot.restore_if_empty(envelope);
            }
        }
    }

    async fn close(&self) {
        self.sender.close().await;
        if let Some(final_ack) = self.receiver.begin_close().await {
            self.send_explicit_ack(final_ack).await;
        }
    }

    async fn teardown(&self, reason: CloseReason) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }

        match reason {
            CloseReason::Closed => info!("connection {} closed", self.id),
            _ => warn!("connection {} failed: {}", self.id, reason),
        }

        self.sender.teardown(reason).await;
        self.receiver.teardown(reason).await;
        self.registry.deregister(self.local_index);
        self.channel.close().await;
    }

    async fn do_sweep(&self, now: Instant) -> SweepOutcome {
        if self.torn_down.load(Ordering::Acquire) {
            return SweepOutcome::Remove;
        }

        if self.abandoned.swap(false, Ordering::AcqRel) {
            debug!("connection handle was dropped without closing - closing");
            self.close().await;
        }

        if let Some(envelope) = self.receiver.sweep_ack().await {
            self.send_explicit_ack(envelope).await;
        }

        match self.sender.sweep(now).await {
            SenderSweep::Keep => SweepOutcome::Keep,
            SenderSweep::Finished => {
                self.teardown(CloseReason::Closed).await;
                SweepOutcome::Remove
            }
            SenderSweep::Failed(reason) => {
                self.teardown(reason).await;
                SweepOutcome::Remove
            }
        }
    }

    /// Active loop - this runs until the connection is torn down
    async fn recv_loop(self: Arc<Self>) {
        debug!("starting receive loop");
        loop {
            let frame = match self.channel.receive().await {
                Ok(frame) => frame,
                Err(ReliableError::ConnectionClosed) => break,
                Err(e) => {
                    warn!("frame channel error: {}", e);
                    continue;
                }
            };
            self.on_frame(frame).await;

            // drain whatever else is available before waiting again
            loop {
                match self.channel.poll() {
                    Ok(Some(frame)) => self.on_frame(frame).await,
                    Ok(None) => break,
                    Err(ReliableError::ConnectionClosed) => break,
                    Err(e) => {
                        warn!("frame channel error: {}", e);
                        break;
                    }
                }
            }
        }

        debug!("frame channel closed - ending receive loop");
        self.teardown(CloseReason::ChannelClosed).await;
    }

    /// Active loop - this runs until the sender is deregistered from the piggyback registry
    async fn ack_loop(self: Arc<Self>, mut inbox: AckInbox) {
        while let Some(ack) = inbox.recv().await {
            self.sender.handle_ack(ack).await;
        }
        debug!("ack inbox closed - ending ack loop");
    }
}

#[async_trait]
impl SweepTarget for ConnectionCore {
    async fn sweep(&self, now: Instant) -> SweepOutcome {
        self.do_sweep(now)
            .instrument(self.span.clone())
            .await
    }
}

/// A reliable, ordered connection on top of a [FrameChannel].
///
/// A connection has a receive loop and an ack loop running as tokio tasks, and it is swept
///  periodically by a [Sweeper]. Both loops end when the connection is torn down, i.e. after it
///  was closed and the shutdown delay has passed, after the frame channel was closed, or after
///  the retry budget was exhausted.
///
/// Dropping a connection without closing it closes it on the next sweep.
pub struct Connection {
    core: Arc<ConnectionCore>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.core.torn_down.load(Ordering::Acquire) {
            self.core.abandoned.store(true, Ordering::Release);
        }
    }
}

impl Connection {
    /// Start the reliability layer for a channel on which connection setup completed
    pub async fn open(
        channel: Arc<dyn FrameChannel>,
        config: &ReliableConfig,
        params: ConnectionParams,
        registry: Arc<PiggybackRegistry>,
        sweeper: &Sweeper,
    ) -> anyhow::Result<Connection> {
        config.validate()?;
        let config_for_connection = Arc::new(EffectiveConnectionConfig::new(config, channel.mtu(), channel.header_offset(), params.window_size)?);
        let inbox = registry.register(params.local_index)?;

        let id = Uuid::new_v4();
        let span = span!(Level::DEBUG, "connection", %id);
        info!(parent: &span, "opening connection with window size {}, MTU {}, partner index {} (local {})",
            config_for_connection.window_size, config_for_connection.mtu, params.partner_index, params.local_index);

        let slot = Arc::new(PiggybackSlot::default());
        let buffer_pool = Arc::new(BufferPool::new(config_for_connection.mtu, config.buffer_pool_size));
        let sender = ReliableSender::new(config_for_connection.clone(), channel.clone(), buffer_pool, slot.clone());
        let receiver = ReliableReceiver::new(config_for_connection.window_size, params.partner_index, slot.clone());
        receiver.activate().await;

        let core = Arc::new(ConnectionCore {
            id,
            span: span.clone(),
            config: config_for_connection,
            channel,
            slot,
            sender,
            receiver,
            registry,
            local_index: params.local_index,
            torn_down: AtomicBool::new(false),
            abandoned: AtomicBool::new(false),
            num_malformed_frames: AtomicU64::new(0),
        });

        tokio::spawn(core.clone().recv_loop().instrument(span.clone()));
        tokio::spawn(core.clone().ack_loop(inbox).instrument(span));
        sweeper.register(core.clone());

        Ok(Connection { core })
    }

    pub fn id(&self) -> Uuid {
        self.core.id
    }

    pub fn max_payload_len(&self) -> usize {
        self.core.config.max_payload_len
    }

    pub fn is_torn_down(&self) -> bool {
        self.core.torn_down.load(Ordering::Acquire)
    }

    /// Send a message, waiting while the send window is full
    pub async fn send_message(&self, message: &[u8]) -> Result<()> {
        let result = self.core.sender.send(message)
            .instrument(self.core.span.clone())
            .await;
        if let Err(ReliableError::SequenceExhausted) = result {
            self.core.teardown(CloseReason::SequenceExhausted).await;
        }
        result
    }

    /// Wait for the next fragment, returning at most `max_len` bytes of it. The returned
    ///  fragment's `is_last` flag marks the end of a message.
    pub async fn receive(&self, max_len: usize) -> Result<ReceivedFragment> {
        self.core.receiver.receive(max_len).await
    }

    /// Non-blocking variant of [Connection::receive]
    pub async fn try_receive(&self, max_len: usize) -> Result<Option<ReceivedFragment>> {
        self.core.receiver.try_receive(max_len).await
    }

    /// Wait for the next complete message
    pub async fn receive_message(&self) -> Result<Bytes> {
        let first = self.receive(usize::MAX).await?;
        if first.is_last {
            return Ok(first.payload);
        }

        let mut message = BytesMut::from(first.payload.as_ref());
        loop {
            let fragment = self.receive(usize::MAX).await?;
            message.extend_from_slice(&fragment.payload);
            if fragment.is_last {
                return Ok(message.freeze());
            }
        }
    }

    /// Close the connection. Pending and future calls fail with `ConnectionClosed`, while
    ///  fragments in flight are still retransmitted until they are acknowledged or the shutdown
    ///  delay expires.
    pub async fn close(&self) {
        self.core.close()
            .instrument(self.core.span.clone())
            .await
    }

    pub async fn stats(&self) -> ConnectionStats {
        let sender = self.core.sender.stats().await;
        let receiver = self.core.receiver.stats().await;
        ConnectionStats {
            num_fragments_sent: sender.num_fragments_sent,
            num_retransmits: sender.num_retransmits,
            num_unacked: sender.num_unacked,
            num_fragments_received: receiver.num_fragments_received,
            num_duplicates: receiver.num_duplicates,
            num_malformed_frames: self.core.num_malformed_frames.load(Ordering::Relaxed),
            num_malformed_acks: sender.num_malformed_acks,
            num_acks_offered: receiver.num_acks_offered,
            num_acks_piggybacked: sender.num_acks_piggybacked,
            num_acks_explicit: receiver.num_acks_explicit,
            num_acks_flushed: sender.num_acks_flushed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ack::AckBlock;
    use crate::channel::memory::{LinkImpairment, MemoryChannel, MemoryChannelConfig};
    use crate::frag_count::FragCount;
    use crate::frame_header::DataFrameHeader;
    use bytes::BufMut;
    use rstest::rstest;
    use std::time::Duration;
    use tokio::runtime::Builder;

    const HEADER_OFFSET: usize = 4;

    fn channel_pair() -> (MemoryChannel, MemoryChannel) {
        MemoryChannel::pair(MemoryChannelConfig {
            mtu: 100,
            header_offset: HEADER_OFFSET,
            capacity: 64,
            impairment: LinkImpairment::NONE,
            seed: 1,
        }).unwrap()
    }

    fn params() -> ConnectionParams {
        ConnectionParams {
            window_size: 8,
            local_index: 1,
            partner_index: 2,
        }
    }

    /// Open a connection on one end of a channel pair, leaving the other end for the test to
    ///  play the peer with raw frames
    async fn open_with_raw_peer() -> (Connection, MemoryChannel, Arc<PiggybackRegistry>, Arc<Sweeper>) {
        let (a, b) = channel_pair();
        let registry = Arc::new(PiggybackRegistry::new());
        let sweeper = Sweeper::new(Duration::from_millis(20));
        let connection = Connection::open(Arc::new(a), &ReliableConfig::default_lan(), params(), registry.clone(), &sweeper)
            .await
            .unwrap();
        (connection, b, registry, sweeper)
    }

    fn raw_data_frame(seq: u32, is_last: bool, envelope: PiggybackEnvelope, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_OFFSET];
        DataFrameHeader {
            frag_count: FragCount::new(seq, is_last),
            envelope,
        }.ser(&mut buf);
        buf.put_slice(payload);
        buf
    }

    /// give the connection's background tasks a chance to run
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn parse_raw(frame: Bytes) -> Frame {
        Frame::parse(frame.slice(HEADER_OFFSET..)).unwrap()
    }

    #[rstest]
    #[case::invalid_config(ReliableConfig { window_size: 0, ..ReliableConfig::default_lan() }, params())]
    #[case::invalid_window(ReliableConfig::default_lan(), ConnectionParams { window_size: 0, ..params() })]
    #[case::reserved_index(ReliableConfig::default_lan(), ConnectionParams { local_index: PiggybackEnvelope::NO_PARTNER, ..params() })]
    fn test_open_invalid(#[case] config: ReliableConfig, #[case] params: ConnectionParams) {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (a, _b) = channel_pair();
            let sweeper = Sweeper::new(Duration::from_millis(20));
            let result = Connection::open(Arc::new(a), &config, params, Arc::new(PiggybackRegistry::new()), &sweeper).await;
            assert!(result.is_err());
            assert_eq!(sweeper.num_targets(), 0);
        });
    }

    #[test]
    fn test_open_duplicate_index() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (connection, _peer, registry, sweeper) = open_with_raw_peer().await;
            let (c, _d) = channel_pair();
            assert!(Connection::open(Arc::new(c), &ReliableConfig::default_lan(), params(), registry, &sweeper).await.is_err());
            assert_eq!(connection.max_payload_len(), 100 - HEADER_OFFSET - DataFrameHeader::SERIALIZED_LEN);
        });
    }

    #[test]
    fn test_send_writes_data_frames() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (connection, peer, _registry, _sweeper) = open_with_raw_peer().await;
            connection.send_message(b"hello").await.unwrap();

            let frame = peer.receive().await.unwrap();
            assert_eq!(&frame[..HEADER_OFFSET], &[0, 0, 0, 0]);
            match parse_raw(frame) {
                Frame::Data { header, payload } => {
                    assert_eq!(header.frag_count, FragCount::new(0, true));
                    assert!(header.envelope.is_empty());
                    assert_eq!(payload.as_ref(), b"hello");
                }
                other => panic!("unexpected frame {:?}", other),
            }
        });
    }

    #[test]
    fn test_duplicate_triggers_explicit_ack() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (connection, peer, _registry, _sweeper) = open_with_raw_peer().await;

            let frame = raw_data_frame(0, true, PiggybackEnvelope::EMPTY, b"x");
            peer.send(&frame).await.unwrap();
            assert_eq!(connection.receive_message().await.unwrap().as_ref(), b"x");

            peer.send(&frame).await.unwrap();
            let ack_frame = peer.receive().await.unwrap();
            assert_eq!(parse_raw(ack_frame), Frame::Control(PiggybackEnvelope {
                partner_index: 2,
                ack: AckBlock { next_contiguous: 1, received_beyond: 0 },
            }));
            assert_eq!(connection.stats().await.num_duplicates, 1);
        });
    }

    #[test]
    fn test_piggybacked_ack_reaches_sender() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (connection, peer, _registry, _sweeper) = open_with_raw_peer().await;
            connection.send_message(b"a").await.unwrap();
            connection.send_message(b"b").await.unwrap();
            assert_eq!(connection.stats().await.num_unacked, 2);

            // the peer acknowledges both fragments, piggybacked on a data frame
            let envelope = PiggybackEnvelope {
                partner_index: 1,
                ack: AckBlock { next_contiguous: 2, received_beyond: 0 },
            };
            peer.send(&raw_data_frame(0, true, envelope, b"reply")).await.unwrap();

            assert_eq!(connection.receive_message().await.unwrap().as_ref(), b"reply");
            settle().await;
            assert_eq!(connection.stats().await.num_unacked, 0);
        });
    }

    #[test]
    fn test_ack_at_threshold_is_sent_at_once_without_reverse_traffic() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (connection, peer, _registry, _sweeper) = open_with_raw_peer().await;

            // half the window of 8
            for seq in 0..4 {
                peer.send(&raw_data_frame(seq, true, PiggybackEnvelope::EMPTY, b"x")).await.unwrap();
            }
            for _ in 0..4 {
                connection.receive_message().await.unwrap();
            }

            let ack_frame = peer.receive().await.unwrap();
            assert_eq!(parse_raw(ack_frame), Frame::Control(PiggybackEnvelope {
                partner_index: 2,
                ack: AckBlock { next_contiguous: 4, received_beyond: 0 },
            }));
            assert_eq!(connection.stats().await.num_acks_flushed, 1);
        });
    }

    #[test]
    fn test_sequence_exhaustion_fails_connection() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (connection, _peer, _registry, sweeper) = open_with_raw_peer().await;
            connection.core.sender.set_next_seq(FragCount::MAX_SEQ).await;

            let two_fragments = vec![1u8; connection.max_payload_len() + 1];
            assert!(matches!(connection.send_message(&two_fragments).await, Err(ReliableError::SequenceExhausted)));

            assert!(connection.is_torn_down());
            assert!(matches!(connection.receive(10).await, Err(ReliableError::SequenceExhausted)));
            assert!(matches!(connection.send_message(b"x").await, Err(ReliableError::SequenceExhausted)));

            sweeper.sweep_once(Instant::now()).await;
            assert_eq!(sweeper.num_targets(), 0);
        });
    }

    #[test]
    fn test_malformed_frames_are_dropped() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (connection, peer, _registry, _sweeper) = open_with_raw_peer().await;

            peer.send(&[0, 0]).await.unwrap();
            peer.send(&[0u8; HEADER_OFFSET + 17]).await.unwrap();
            peer.send(&raw_data_frame(0, true, PiggybackEnvelope::EMPTY, b"ok")).await.unwrap();

            assert_eq!(connection.receive_message().await.unwrap().as_ref(), b"ok");
            assert_eq!(connection.try_receive(10).await.unwrap(), None);
            assert_eq!(connection.stats().await.num_malformed_frames, 2);
        });
    }

    #[test]
    fn test_sweep_flushes_withheld_ack() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (connection, peer, _registry, sweeper) = open_with_raw_peer().await;

            peer.send(&raw_data_frame(0, true, PiggybackEnvelope::EMPTY, b"x")).await.unwrap();
            assert_eq!(connection.receive_message().await.unwrap().as_ref(), b"x");
            assert_eq!(peer.poll().unwrap(), None);

            sweeper.sweep_once(Instant::now()).await;
            let ack_frame = peer.poll().unwrap().unwrap();
            assert_eq!(parse_raw(ack_frame), Frame::Control(PiggybackEnvelope {
                partner_index: 2,
                ack: AckBlock { next_contiguous: 1, received_beyond: 0 },
            }));
        });
    }

    #[test]
    fn test_close() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (connection, peer, registry, sweeper) = open_with_raw_peer().await;
            connection.send_message(b"x").await.unwrap();
            let _data_frame = peer.receive().await.unwrap();

            connection.close().await;
            assert!(matches!(connection.send_message(b"y").await, Err(ReliableError::ConnectionClosed)));
            assert!(matches!(connection.receive(10).await, Err(ReliableError::ConnectionClosed)));

            // final explicit ack
            assert!(matches!(parse_raw(peer.receive().await.unwrap()), Frame::Control(_)));

            // lingering until the fragment is acknowledged
            sweeper.sweep_once(Instant::now()).await;
            assert!(!connection.is_torn_down());

            registry.dispatch(&PiggybackEnvelope {
                partner_index: 1,
                ack: AckBlock { next_contiguous: 1, received_beyond: 0 },
            });
            settle().await;
            sweeper.sweep_once(Instant::now()).await;

            assert!(connection.is_torn_down());
            assert_eq!(sweeper.num_targets(), 0);
            assert!(!registry.dispatch(&PiggybackEnvelope {
                partner_index: 1,
                ack: AckBlock { next_contiguous: 1, received_beyond: 0 },
            }));
            assert!(matches!(peer.poll(), Err(ReliableError::ConnectionClosed)));
        });
    }

    #[test]
    fn test_channel_closed_by_peer() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (connection, peer, _registry, _sweeper) = open_with_raw_peer().await;
            peer.close().await;

            assert!(matches!(connection.receive(10).await, Err(ReliableError::ConnectionClosed)));
            assert!(matches!(connection.send_message(b"x").await, Err(ReliableError::ConnectionClosed)));
            assert!(connection.is_torn_down());
        });
    }

    #[test]
    fn test_dropped_connection_is_closed() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (connection, peer, _registry, sweeper) = open_with_raw_peer().await;
            drop(connection);
            assert_eq!(sweeper.num_targets(), 1);

            // nothing is in flight, so closing completes in a single pass
            sweeper.sweep_once(Instant::now()).await;
            assert_eq!(sweeper.num_targets(), 0);
            assert!(peer.is_closed());
        });
    }
}
