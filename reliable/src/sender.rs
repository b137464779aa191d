use crate::ack::AckBlock;
use crate::buffers::buffer_pool::BufferPool;
use crate::buffers::frame_buf::FrameBuf;
use crate::channel::FrameChannel;
use crate::config::EffectiveConnectionConfig;
use crate::error::{CloseReason, ReliableError, Result};
use crate::frag_count::FragCount;
use crate::frame_header::{DataFrameHeader, PiggybackEnvelope};
use crate::piggyback::PiggybackSlot;
use bytes::BufMut;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct SenderStats {
    /// first transmissions, i.e. not counting retransmissions
    pub num_fragments_sent: u64,
    pub num_retransmits: u64,
    pub num_malformed_acks: u64,
    /// acks of the reverse direction that were carried by outgoing data frames
    pub num_acks_piggybacked: u64,
    /// acks of the reverse direction that were waiting for a data frame, but were sent as
    ///  control frames because no message was being sent
    pub num_acks_flushed: u64,
    pub num_unacked: usize,
}

/// Result of a sweep over a sender
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SenderSweep {
    Keep,
    /// closing is complete, the connection can be torn down
    Finished,
    Failed(CloseReason),
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum SenderState {
    Active,
    Closing { deadline: Instant },
    Closed,
}

struct FragmentRecord {
    /// the complete frame, starting with the channel's header area. This is `None` until the
    ///  first transmission attempt.
    frame: Option<FrameBuf>,
    sent: bool,
    last_sent_at: Instant,
    /// acknowledged selectively. The record is kept until the ack cursor passes it.
    acked: bool,
    num_retransmits: u32,
}

struct SenderInner {
    state: SenderState,
    close_reason: Option<CloseReason>,

    next_seq: u32,
    /// first fragment that was not acknowledged, either cumulatively or selectively
    lowest_unacked: u32,
    /// the highest contiguous cursor received from the peer so far
    ack_cursor: u32,
    unacked: BTreeMap<u32, FragmentRecord>,

    stats: SenderStats,
}

impl SenderInner {
    fn check_active(&self) -> Result<()> {
        match self.state {
            SenderState::Active => Ok(()),
            _ => Err(self.close_reason.unwrap_or(CloseReason::Closed).to_error()),
        }
    }

    fn update_lowest_unacked(&mut self) {
        self.lowest_unacked = self.unacked.iter()
            .find(|(_, record)| !record.acked)
            .map(|(&seq, _)| seq)
            .unwrap_or(self.next_seq);
    }

    fn release_all(&mut self, buffer_pool: &BufferPool) {
        for record in std::mem::take(&mut self.unacked).into_values() {
            if let Some(frame) = record.frame {
                buffer_pool.return_to_pool(frame);
            }
        }
    }
}

/// The sending half of a connection: it splits messages into fragments, limits the number of
///  unacknowledged fragments to the window size, and retransmits fragments that are not
///  acknowledged in time.
///
/// Retransmission is driven by the sweeper calling [ReliableSender::sweep] rather than by a
///  timer per fragment.
pub struct ReliableSender {
    config: Arc<EffectiveConnectionConfig>,
    channel: Arc<dyn FrameChannel>,
    buffer_pool: Arc<BufferPool>,
    slot: Arc<PiggybackSlot>,
    inner: RwLock<SenderInner>,
    window_space: Notify,
    /// keeps the fragments of concurrently sent messages from interleaving
    message_lock: Mutex<()>,
    /// a message is being sent and not waiting for window space, so its next fragment will
    ///  pick up whatever ack is in the piggyback slot
    carrying_acks: AtomicBool,
    num_acks_flushed: AtomicU64,
}

/// Marks a message as being sent for as long as it is in scope
struct CarryingAcks<'a> {
    sender: &'a ReliableSender,
}

impl<'a> CarryingAcks<'a> {
    fn start(sender: &'a ReliableSender) -> CarryingAcks<'a> {
        sender.carrying_acks.store(true, Ordering::SeqCst);
        CarryingAcks { sender }
    }
}

impl Drop for CarryingAcks<'_> {
    fn drop(&mut self) {
        self.sender.stop_carrying_acks();
    }
}

impl ReliableSender {
    pub fn new(
        config: Arc<EffectiveConnectionConfig>,
        channel: Arc<dyn FrameChannel>,
        buffer_pool: Arc<BufferPool>,
        slot: Arc<PiggybackSlot>,
    ) -> ReliableSender {
        ReliableSender {
            config,
            channel,
            buffer_pool,
            slot,
            inner: RwLock::new(SenderInner {
                state: SenderState::Active,
                close_reason: None,
                next_seq: 0,
                lowest_unacked: 0,
                ack_cursor: 0,
                unacked: Default::default(),
                stats: Default::default(),
            }),
            window_space: Notify::new(),
            message_lock: Mutex::new(()),
            carrying_acks: AtomicBool::new(false),
            num_acks_flushed: AtomicU64::new(0),
        }
    }

    pub async fn stats(&self) -> SenderStats {
        let inner = self.inner.read().await;
        SenderStats {
            num_unacked: inner.unacked.len(),
            num_acks_flushed: self.num_acks_flushed.load(Ordering::Relaxed),
            ..inner.stats
        }
    }

    /// Send a message, splitting it into as many fragments as necessary. The last fragment
    ///  carries the last-fragment marker, and an empty message is sent as a single empty
    ///  fragment.
    ///
    /// This waits while the send window is full. Transient failures of the frame channel are
    ///  left to retransmission and are not reported.
    ///
    /// A message that does not fit into the remaining sequence number space is not sent at all,
    ///  and the sender fails with `SequenceExhausted`.
    pub async fn send(&self, message: &[u8]) -> Result<()> {
        let _message_guard = self.message_lock.lock().await;

        let max_payload_len = self.config.max_payload_len;
        let num_fragments = message.len().div_ceil(max_payload_len).max(1);
        self.check_seq_space(num_fragments).await?;
        trace!("sending message of {} bytes as {} fragment(s)", message.len(), num_fragments);

        let _carrying_acks = CarryingAcks::start(self);
        for (i, offset) in (0..num_fragments).map(|i| (i, i * max_payload_len)) {
            let end = message.len().min(offset + max_payload_len);
            self.send_fragment(&message[offset..end], i + 1 == num_fragments).await?;
        }
        Ok(())
    }

    async fn check_seq_space(&self, num_fragments: usize) -> Result<()> {
        let inner = self.inner.read().await;
        inner.check_active()?;

        let last_seq = u32::try_from(num_fragments - 1).ok()
            .and_then(|n| inner.next_seq.checked_add(n));
        match last_seq {
            Some(last_seq) if last_seq <= FragCount::MAX_SEQ => Ok(()),
            _ => {
                warn!("sequence numbers exhausted: {} fragment(s) do not fit after #{}", num_fragments, inner.next_seq);
                drop(inner);
                self.teardown(CloseReason::SequenceExhausted).await;
                Err(ReliableError::SequenceExhausted)
            }
        }
    }

    async fn send_fragment(&self, payload: &[u8], is_last: bool) -> Result<()> {
        let seq = self.reserve_seq().await?;
        let frag_count = FragCount::new(seq, is_last);

        let envelope = self.slot.take();
        let mut frame = self.buffer_pool.get_from_pool();
        frame.reserve_header(self.config.header_offset);
        DataFrameHeader {
            frag_count,
            envelope: envelope.unwrap_or(PiggybackEnvelope::EMPTY),
        }.ser(&mut frame);
        frame.put_slice(payload);

        trace!("sending fragment {} with {} bytes payload", frag_count, payload.len());
        let result = self.channel.send(frame.as_ref()).await;

        let mut inner = self.inner.write().await;
        let now = Instant::now();
        let last_sent_at = match result {
            Ok(()) => {
                inner.stats.num_fragments_sent += 1;
                if envelope.is_some() {
                    inner.stats.num_acks_piggybacked += 1;
                }
                now
            }
            Err(ReliableError::ConnectionClosed) => {
                debug!("frame channel closed while sending fragment {}", frag_count);
                self.buffer_pool.return_to_pool(frame);
                return Err(ReliableError::ConnectionClosed);
            }
            Err(e) => {
                debug!("sending fragment {} failed: {} - leaving it to retransmission", frag_count, e);
                if let Some(envelope) = envelope {
                    self.slot.restore_if_empty(envelope);
                }
                now.checked_sub(self.config.retransmit_timeout)
                    .unwrap_or(now)
            }
        };

        match inner.unacked.get_mut(&seq) {
            Some(record) => {
                record.frame = Some(frame);
                record.sent = true;
                record.last_sent_at = last_sent_at;
            }
            None => {
                // acknowledged (or torn down) while it was being sent
                self.buffer_pool.return_to_pool(frame);
            }
        }
        Ok(())
    }

    /// Assign the next sequence number, waiting for space in the send window
    async fn reserve_seq(&self) -> Result<u32> {
        loop {
            let window_space = self.window_space.notified();
            tokio::pin!(window_space);
            window_space.as_mut().enable();

            {
                let mut inner = self.inner.write().await;
                inner.check_active()?;

                if inner.next_seq - inner.lowest_unacked < self.config.window_size {
                    let seq = inner.next_seq;
                    inner.next_seq += 1;
                    inner.unacked.insert(seq, FragmentRecord {
                        frame: None,
                        sent: false,
                        last_sent_at: Instant::now(),
                        acked: false,
                        num_retransmits: 0,
                    });
                    return Ok(seq);
                }

                trace!("send window is full ({} unacked from #{}) - waiting", inner.next_seq - inner.lowest_unacked, inner.lowest_unacked);
            }

            // the peer may be waiting for our ack before it can open the window
            self.stop_carrying_acks();
            window_space.await;
            self.carrying_acks.store(true, Ordering::SeqCst);
        }
    }

    /// Send an ack as a control frame. This never waits for the frame channel.
    pub fn send_ack(&self, envelope: &PiggybackEnvelope) -> Result<()> {
        let mut buf = self.buffer_pool.get_from_pool();
        buf.reserve_header(self.config.header_offset);
        envelope.ser(&mut buf);

        let result = self.channel.try_send(buf.as_ref());
        self.buffer_pool.return_to_pool(buf);
        result
    }

    /// Send the ack waiting in the piggyback slot as a control frame, unless a message is being
    ///  sent whose next fragment will carry it
    pub fn flush_ack_if_idle(&self) {
        if !self.carrying_acks.load(Ordering::SeqCst) {
            self.flush_pending_ack();
        }
    }

    fn stop_carrying_acks(&self) {
        self.carrying_acks.store(false, Ordering::SeqCst);
        self.flush_pending_ack();
    }

    fn flush_pending_ack(&self) {
        let Some(envelope) = self.slot.take() else {
            return;
        };

        match self.send_ack(&envelope) {
            Ok(()) => {
                trace!("no data frame going out - sent ack {:?} as a control frame", envelope.ack);
                self.num_acks_flushed.fetch_add(1, Ordering::Relaxed);
            }
            Err(ReliableError::ConnectionClosed) => {}
            Err(e) => {
                trace!("sending ack failed: {} - leaving it for the next sweep", e);
                self.slot.restore_if_empty(envelope);
            }
        }
    }

    /// Apply an ack from the peer's receiver. Malformed acks are ignored as a whole.
    pub async fn handle_ack(&self, ack: AckBlock) {
        let mut inner = self.inner.write().await;
        if inner.state == SenderState::Closed {
            return;
        }

        if let Err(e) = ack.validate(self.config.window_size, inner.next_seq) {
            debug!("ignoring malformed ack: {}", e);
            inner.stats.num_malformed_acks += 1;
            return;
        }

        if ack.next_contiguous > inner.ack_cursor {
            inner.ack_cursor = ack.next_contiguous;
            let still_unacked = inner.unacked.split_off(&ack.next_contiguous);
            let released = std::mem::replace(&mut inner.unacked, still_unacked);
            trace!("ack cursor advanced to #{}, releasing {} fragment(s)", ack.next_contiguous, released.len());
            for record in released.into_values() {
                if let Some(frame) = record.frame {
                    self.buffer_pool.return_to_pool(frame);
                }
            }
        }
        else if ack.next_contiguous < inner.ack_cursor {
            trace!("stale ack cursor #{} (already at #{}) - applying selective part only", ack.next_contiguous, inner.ack_cursor);
        }

        for seq in ack.received_beyond_seqs() {
            if let Some(record) = inner.unacked.get_mut(&seq) {
                record.acked = true;
            }
        }

        inner.update_lowest_unacked();
        drop(inner);

        self.window_space.notify_waiters();
    }

    /// One pass of the sweeper: retransmit fragments that were not acknowledged in time, and
    ///  check if closing is complete. This never waits for the frame channel: if it applies
    ///  backpressure, the remaining retransmissions are left for the next pass.
    pub async fn sweep(&self, now: Instant) -> SenderSweep {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;

        match inner.state {
            SenderState::Closed => return SenderSweep::Finished,
            SenderState::Closing { deadline } => {
                if inner.unacked.values().all(|record| record.acked) {
                    debug!("all fragments acknowledged - closing complete");
                    return SenderSweep::Finished;
                }
                if now >= deadline {
                    debug!("shutdown delay expired with {} unacknowledged fragment(s)", inner.unacked.len());
                    return SenderSweep::Finished;
                }
            }
            SenderState::Active => {}
        }

        let due = inner.unacked.iter()
            .filter(|(_, record)| record.sent && !record.acked && now.saturating_duration_since(record.last_sent_at) > self.config.retransmit_timeout)
            .map(|(&seq, _)| seq)
            .collect::<Vec<_>>();

        for seq in due {
            let Some(record) = inner.unacked.get_mut(&seq) else {
                continue;
            };
            if record.num_retransmits >= self.config.max_retransmits {
                warn!("fragment #{} was not acknowledged after {} retransmissions - giving up", seq, record.num_retransmits);
                return SenderSweep::Failed(CloseReason::RetransmitBudgetExceeded { seq, budget: self.config.max_retransmits });
            }
            let Some(frame) = record.frame.as_mut() else {
                continue;
            };

            let envelope = self.slot.take();
            write_envelope(frame, self.config.header_offset, &envelope.unwrap_or(PiggybackEnvelope::EMPTY));

            match self.channel.try_send(frame.as_ref()) {
                Ok(()) => {
                    debug!("retransmitted fragment #{}", seq);
                    record.num_retransmits += 1;
                    record.last_sent_at = now;
                    inner.stats.num_retransmits += 1;
                    if envelope.is_some() {
                        inner.stats.num_acks_piggybacked += 1;
                    }
                }
                Err(ReliableError::ConnectionClosed) => {
                    return SenderSweep::Failed(CloseReason::ChannelClosed);
                }
                Err(e) => {
                    trace!("retransmitting fragment #{} failed: {} - trying again later", seq, e);
                    if let Some(envelope) = envelope {
                        self.slot.restore_if_empty(envelope);
                    }
                    break;
                }
            }
        }

        SenderSweep::Keep
    }

    /// Stop accepting messages. Fragments that are in flight are still retransmitted until they
    ///  are acknowledged or the shutdown delay expires.
    pub async fn close(&self) {
        let mut inner = self.inner.write().await;
        if inner.state == SenderState::Active {
            debug!("closing sender with {} unacknowledged fragment(s)", inner.unacked.len());
            inner.state = SenderState::Closing {
                deadline: Instant::now() + self.config.shutdown_delay,
            };
            inner.close_reason.get_or_insert(CloseReason::Closed);
        }
        drop(inner);

        self.window_space.notify_waiters();
    }

    pub async fn teardown(&self, reason: CloseReason) {
        let mut inner = self.inner.write().await;
        if inner.state != SenderState::Closed {
            debug!("tearing down sender: {}", reason);
            inner.state = SenderState::Closed;
            inner.close_reason.get_or_insert(reason);
            inner.release_all(&self.buffer_pool);
        }
        drop(inner);

        self.window_space.notify_waiters();
    }

    #[cfg(test)]
    pub(crate) async fn set_next_seq(&self, seq: u32) {
        let mut inner = self.inner.write().await;
        inner.next_seq = seq;
        inner.lowest_unacked = seq;
        inner.ack_cursor = seq;
    }
}

/// Overwrite the piggyback envelope of an assembled data frame
fn write_envelope(frame: &mut FrameBuf, header_offset: usize, envelope: &PiggybackEnvelope) {
    let start = header_offset + DataFrameHeader::SERIALIZED_LEN - PiggybackEnvelope::SERIALIZED_LEN;
    let mut target = &mut frame.as_mut()[start..start + PiggybackEnvelope::SERIALIZED_LEN];
    envelope.ser(&mut target);
}
