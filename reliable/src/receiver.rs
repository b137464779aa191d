use crate::ack::AckBlock;
use crate::error::{CloseReason, Result};
use crate::frag_count::FragCount;
use crate::frame_header::PiggybackEnvelope;
use crate::piggyback::PiggybackSlot;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, trace};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ReceiverState {
    AwaitingConnect,
    Active,
    /// closed locally: user calls fail, but arriving fragments are still acknowledged
    Closing,
    Closed,
}

/// A (piece of a) fragment as it is handed to the application
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct ReceivedFragment {
    pub seq: u32,
    pub payload: Bytes,
    /// `true` if this is the end of a message. A fragment that is returned in several pieces
    ///  because it exceeds a read's maximum length has this flag on its final piece only.
    pub is_last: bool,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct ReceiverStats {
    pub num_fragments_received: u64,
    pub num_duplicates: u64,
    /// acks left for piggybacking in the reverse direction's data frames
    pub num_acks_offered: u64,
    /// acks handed out to be sent as control frames
    pub num_acks_explicit: u64,
}

struct QueuedFragment {
    payload: Bytes,
    is_last: bool,
}

enum AckDecision {
    Skip,
    Piggyback(AckBlock),
    Explicit(AckBlock),
}

struct ReceiverInner {
    window_size: u32,
    state: ReceiverState,
    close_reason: Option<CloseReason>,

    /// the next fragment to be handed to the application
    next_deliver: u32,
    /// all fragments below this were received. This is never less than `next_deliver`.
    next_contiguous: u32,
    /// Boundary of what was reported to the peer: every fragment below it was either
    ///  acknowledged or reported missing by an ack that was emitted, or it arrived in order
    ///  after that ack. A fragment arriving beyond this boundary reveals a gap that the peer
    ///  does not know about yet.
    next_non_missing: u32,
    /// one past the highest sequence number received so far
    max_frag_count: u32,
    /// `next_contiguous` at the time of the last emitted ack
    last_contiguous_ack: u32,
    last_ack: Option<AckBlock>,
    /// there is ack progress that the emission policy held back
    ack_withheld: bool,

    /// fragments that were received but not yet delivered, keyed by sequence number
    queue: BTreeMap<u32, QueuedFragment>,

    stats: ReceiverStats,
}

impl ReceiverInner {
    fn new(window_size: u32) -> ReceiverInner {
        ReceiverInner {
            window_size,
            state: ReceiverState::AwaitingConnect,
            close_reason: None,
            next_deliver: 0,
            next_contiguous: 0,
            next_non_missing: 0,
            max_frag_count: 0,
            last_contiguous_ack: 0,
            last_ack: None,
            ack_withheld: false,
            queue: Default::default(),
            stats: Default::default(),
        }
    }

    fn current_ack(&self) -> AckBlock {
        let beyond_cursor = self.queue.range(self.next_contiguous..)
            .map(|(&seq, _)| seq)
            .take_while(|&seq| seq - self.next_contiguous < AckBlock::BITSET_LEN);
        AckBlock::encode(self.next_contiguous, beyond_cursor)
    }

    fn on_fragment(&mut self, frag_count: FragCount, payload: Bytes) -> AckDecision {
        let seq = frag_count.seq();
        self.stats.num_fragments_received += 1;

        if seq < self.next_contiguous || self.queue.contains_key(&seq) {
            debug!("received duplicate fragment {} (contiguous cursor is #{}) - dropping", frag_count, self.next_contiguous);
            self.stats.num_duplicates += 1;
            return self.ack_decision(true);
        }

        if seq - self.next_contiguous >= self.window_size {
            // the sender is window-gated, so this points to a buggy or misconfigured peer
            debug!("fragment {} is beyond the window of {} fragments after #{} - queueing it anyway", frag_count, self.window_size, self.next_contiguous);
        }

        self.queue.insert(seq, QueuedFragment {
            payload,
            is_last: frag_count.is_last(),
        });
        self.max_frag_count = self.max_frag_count.max(seq + 1);
        if seq == self.next_non_missing {
            self.next_non_missing += 1;
        }

        while self.queue.contains_key(&self.next_contiguous) {
            self.next_contiguous += 1;
        }

        self.ack_decision(false)
    }

    fn ack_decision(&mut self, always: bool) -> AckDecision {
        let ack = self.current_ack();

        if always {
            self.record_ack(ack);
            return AckDecision::Explicit(ack);
        }

        if self.last_ack == Some(ack) {
            return AckDecision::Skip;
        }

        let cursor_advanced = self.next_contiguous > self.last_contiguous_ack;
        let unreported_gap = self.max_frag_count > self.next_non_missing;
        if !cursor_advanced && !unreported_gap {
            self.ack_withheld = true;
            return AckDecision::Skip;
        }

        if ack.received_beyond == 0 && self.max_frag_count - self.last_contiguous_ack < self.window_size / 2 {
            trace!("in-order progress to #{} is less than half a window - not acknowledging yet", self.next_contiguous);
            self.ack_withheld = true;
            return AckDecision::Skip;
        }

        self.record_ack(ack);
        AckDecision::Piggyback(ack)
    }

    fn record_ack(&mut self, ack: AckBlock) {
        self.last_ack = Some(ack);
        self.last_contiguous_ack = ack.next_contiguous;
        self.next_non_missing = self.next_non_missing.max(self.max_frag_count);
        self.ack_withheld = false;
    }

    fn take_deliverable(&mut self, max_len: usize) -> Option<ReceivedFragment> {
        let mut front = self.queue.first_entry()?;
        let seq = *front.key();
        if seq != self.next_deliver {
            return None;
        }

        if front.get().payload.len() > max_len {
            let piece = front.get_mut().payload.split_to(max_len);
            trace!("delivering {} bytes of fragment #{}, {} remaining", piece.len(), seq, front.get().payload.len());
            return Some(ReceivedFragment {
                seq,
                payload: piece,
                is_last: false,
            });
        }

        let fragment = front.remove();
        self.next_deliver += 1;
        self.next_contiguous = self.next_contiguous.max(self.next_deliver);

        trace!("delivering fragment #{} with {} bytes", seq, fragment.payload.len());
        Some(ReceivedFragment {
            seq,
            payload: fragment.payload,
            is_last: fragment.is_last,
        })
    }

    fn check_open(&self) -> Result<()> {
        match self.state {
            ReceiverState::AwaitingConnect | ReceiverState::Active => Ok(()),
            ReceiverState::Closing | ReceiverState::Closed => Err(self.close_reason.unwrap_or(CloseReason::Closed).to_error()),
        }
    }
}

/// The receiving half of a connection. It buffers fragments that arrive out of order, drops
///  duplicates, delivers fragments in sequence order, and decides when to acknowledge.
///
/// Acks are preferably left in the connection's [PiggybackSlot] to be carried by the next data
///  frame in the opposite direction. Duplicates (and closing) force an explicit ack, which is
///  returned to the caller for sending as a control frame.
pub struct ReliableReceiver {
    partner_index: u32,
    slot: Arc<PiggybackSlot>,
    inner: RwLock<ReceiverInner>,
    data_available: Notify,
}

impl ReliableReceiver {
    /// `partner_index` is the index under which the peer registered the sender that these
    ///  acks are for
    pub fn new(window_size: u32, partner_index: u32, slot: Arc<PiggybackSlot>) -> ReliableReceiver {
        ReliableReceiver {
            partner_index,
            slot,
            inner: RwLock::new(ReceiverInner::new(window_size)),
            data_available: Notify::new(),
        }
    }

    fn envelope(&self, ack: AckBlock) -> PiggybackEnvelope {
        PiggybackEnvelope {
            partner_index: self.partner_index,
            ack,
        }
    }

    pub async fn activate(&self) {
        let mut inner = self.inner.write().await;
        if inner.state == ReceiverState::AwaitingConnect {
            inner.state = ReceiverState::Active;
        }
    }

    pub async fn state(&self) -> ReceiverState {
        self.inner.read().await.state
    }

    pub async fn current_ack(&self) -> AckBlock {
        self.inner.read().await.current_ack()
    }

    pub async fn stats(&self) -> ReceiverStats {
        self.inner.read().await.stats
    }

    /// Handle an arriving fragment. If this requires an explicit ack, the envelope for it is
    ///  returned.
    pub async fn on_fragment(&self, frag_count: FragCount, payload: Bytes) -> Option<PiggybackEnvelope> {
        let mut inner = self.inner.write().await;
        match inner.state {
            ReceiverState::Active | ReceiverState::Closing => {}
            state => {
                debug!("received fragment {} in state {:?} - dropping", frag_count, state);
                return None;
            }
        }

        trace!("received fragment {} with {} bytes", frag_count, payload.len());
        let explicit_ack = match inner.on_fragment(frag_count, payload) {
            AckDecision::Skip => None,
            AckDecision::Piggyback(ack) => {
                trace!("offering ack {:?} for piggybacking", ack);
                inner.stats.num_acks_offered += 1;
                self.slot.offer(self.envelope(ack));
                None
            }
            AckDecision::Explicit(ack) => {
                inner.stats.num_acks_explicit += 1;
                Some(self.envelope(ack))
            }
        };
        drop(inner);

        self.data_available.notify_waiters();
        explicit_ack
    }

    /// Wait for the next fragment in sequence and return at most `max_len` bytes of it. The
    ///  rest of a longer fragment stays queued for the next call. A `max_len` of 0 is treated
    ///  as 1 so that every call makes progress.
    pub async fn receive(&self, max_len: usize) -> Result<ReceivedFragment> {
        loop {
            let data_available = self.data_available.notified();
            tokio::pin!(data_available);
            data_available.as_mut().enable();

            if let Some(fragment) = self.try_receive(max_len).await? {
                return Ok(fragment);
            }

            data_available.await;
        }
    }

    /// Non-blocking variant of [ReliableReceiver::receive]
    pub async fn try_receive(&self, max_len: usize) -> Result<Option<ReceivedFragment>> {
        let mut inner = self.inner.write().await;
        inner.check_open()?;
        Ok(inner.take_deliverable(max_len.max(1)))
    }

    /// Called periodically: returns an ack for explicit sending if the piggyback slot still
    ///  holds an ack that no data frame picked up, or if the emission policy held back progress
    pub async fn sweep_ack(&self) -> Option<PiggybackEnvelope> {
        let mut inner = self.inner.write().await;
        let slot_pending = self.slot.take().is_some();

        match inner.state {
            ReceiverState::Active | ReceiverState::Closing => {}
            _ => return None,
        }
        if !slot_pending && !inner.ack_withheld {
            return None;
        }

        let ack = inner.current_ack();
        inner.record_ack(ack);
        inner.stats.num_acks_explicit += 1;
        trace!("flushing ack {:?} explicitly", ack);
        Some(self.envelope(ack))
    }

    /// Stop accepting user calls, waking up all pending calls. Returns a final ack for
    ///  explicit sending.
    pub async fn begin_close(&self) -> Option<PiggybackEnvelope> {
        let mut inner = self.inner.write().await;
        match inner.state {
            ReceiverState::Closing | ReceiverState::Closed => return None,
            _ => {}
        }

        debug!("closing receiver");
        inner.state = ReceiverState::Closing;
        inner.close_reason.get_or_insert(CloseReason::Closed);

        let ack = inner.current_ack();
        inner.record_ack(ack);
        inner.stats.num_acks_explicit += 1;
        drop(inner);

        self.data_available.notify_waiters();
        Some(self.envelope(ack))
    }

    pub async fn teardown(&self, reason: CloseReason) {
        let mut inner = self.inner.write().await;
        if inner.state != ReceiverState::Closed {
            debug!("tearing down receiver: {}", reason);
            inner.state = ReceiverState::Closed;
            inner.close_reason.get_or_insert(reason);
            inner.queue.clear();
        }
        drop(inner);

        self.data_available.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReliableError;
    use rstest::rstest;
    use std::time::Duration;
    use tokio::runtime::Builder;

    const PARTNER_INDEX: u32 = 17;

    async fn active_receiver(window_size: u32) -> (ReliableReceiver, Arc<PiggybackSlot>) {
        let slot = Arc::new(PiggybackSlot::default());
        let receiver = ReliableReceiver::new(window_size, PARTNER_INDEX, slot.clone());
        receiver.activate().await;
        (receiver, slot)
    }

    fn payload(seq: u32) -> Bytes {
        Bytes::from(vec![seq as u8; 3])
    }

    async fn deliver(receiver: &ReliableReceiver, seq: u32) -> Option<PiggybackEnvelope> {
        receiver.on_fragment(FragCount::new(seq, false), payload(seq)).await
    }

    #[rstest]
    #[case::in_order(vec![0, 1, 2, 3], 4, 0)]
    #[case::reversed(vec![3, 2, 1, 0], 4, 0)]
    #[case::permutation_with_duplicates(vec![3, 0, 2, 2, 5, 1, 4, 0, 5], 6, 3)]
    #[case::only_duplicates_of_first(vec![0, 0, 0], 1, 2)]
    fn test_order(#[case] arrivals: Vec<u32>, #[case] expected_num_delivered: u32, #[case] expected_duplicates: u64) {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (receiver, _) = active_receiver(16).await;
            for seq in arrivals {
                deliver(&receiver, seq).await;
            }

            for expected_seq in 0..expected_num_delivered {
                let fragment = receiver.receive(100).await.unwrap();
                assert_eq!(fragment.seq, expected_seq);
                assert_eq!(fragment.payload, payload(expected_seq));
            }
            assert_eq!(receiver.try_receive(100).await.unwrap(), None);
            assert_eq!(receiver.stats().await.num_duplicates, expected_duplicates);
        });
    }

    #[rstest]
    #[case::once(1)]
    #[case::three_times(3)]
    fn test_duplicates_after_delivery(#[case] k: u64) {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (receiver, _) = active_receiver(16).await;
            deliver(&receiver, 0).await;
            assert_eq!(receiver.receive(100).await.unwrap().seq, 0);

            for _ in 0..k {
                let explicit_ack = deliver(&receiver, 0).await;
                assert_eq!(explicit_ack, Some(PiggybackEnvelope {
                    partner_index: PARTNER_INDEX,
                    ack: AckBlock { next_contiguous: 1, received_beyond: 0 },
                }));
            }

            assert_eq!(receiver.try_receive(100).await.unwrap(), None);
            let stats = receiver.stats().await;
            assert_eq!(stats.num_duplicates, k);
            assert_eq!(stats.num_acks_explicit, k);
            assert_eq!(stats.num_fragments_received, k + 1);
        });
    }

    #[test]
    fn test_selective_ack_for_single_loss() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (receiver, _) = active_receiver(4).await;
            for seq in [0, 1, 3, 4] {
                assert_eq!(deliver(&receiver, seq).await, None);
            }
            assert_eq!(receiver.current_ack().await, AckBlock { next_contiguous: 2, received_beyond: 0b110 });

            deliver(&receiver, 2).await;
            assert_eq!(receiver.current_ack().await, AckBlock { next_contiguous: 5, received_beyond: 0 });
        });
    }

    #[test]
    fn test_gap_is_offered_for_piggybacking() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (receiver, slot) = active_receiver(64).await;
            deliver(&receiver, 0).await;
            assert_eq!(slot.take(), None);

            deliver(&receiver, 2).await;
            assert_eq!(slot.take(), Some(PiggybackEnvelope {
                partner_index: PARTNER_INDEX,
                ack: AckBlock { next_contiguous: 1, received_beyond: 0b10 },
            }));
        });
    }

    #[rstest]
    #[case::below_half_window(64, 31, 0)]
    #[case::crossing_half_window(64, 41, 1)]
    #[case::three_half_windows(64, 96, 3)]
    #[case::small_window(4, 10, 5)]
    fn test_ack_suppression_for_in_order_stream(#[case] window_size: u32, #[case] num_fragments: u32, #[case] expected_num_acks: u64) {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (receiver, _) = active_receiver(window_size).await;
            for seq in 0..num_fragments {
                assert_eq!(deliver(&receiver, seq).await, None);
            }

            let stats = receiver.stats().await;
            assert_eq!(stats.num_acks_offered, expected_num_acks);
            assert_eq!(stats.num_acks_explicit, 0);
        });
    }

    #[test]
    fn test_sweep_ack() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (receiver, slot) = active_receiver(64).await;
            assert_eq!(receiver.sweep_ack().await, None);

            // withheld in-order progress
            deliver(&receiver, 0).await;
            deliver(&receiver, 1).await;
            assert_eq!(receiver.sweep_ack().await.map(|e| e.ack), Some(AckBlock { next_contiguous: 2, received_beyond: 0 }));
            assert_eq!(receiver.sweep_ack().await, None);

            // offered, but not picked up by a data frame
            deliver(&receiver, 3).await;
            assert!(receiver.sweep_ack().await.is_some());
            assert_eq!(slot.take(), None);
            assert_eq!(receiver.sweep_ack().await, None);

            assert_eq!(receiver.stats().await.num_acks_explicit, 2);
        });
    }

    #[rstest]
    #[case::whole(5, vec![(b"hello".to_vec(), true)])]
    #[case::bigger(100, vec![(b"hello".to_vec(), true)])]
    #[case::split(2, vec![(b"he".to_vec(), false), (b"ll".to_vec(), false), (b"o".to_vec(), true)])]
    #[case::zero_reads_single_bytes(0, vec![(b"h".to_vec(), false), (b"e".to_vec(), false), (b"l".to_vec(), false), (b"l".to_vec(), false), (b"o".to_vec(), true)])]
    fn test_partial_reads(#[case] max_len: usize, #[case] expected: Vec<(Vec<u8>, bool)>) {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (receiver, _) = active_receiver(16).await;
            receiver.on_fragment(FragCount::new(0, true), Bytes::from_static(b"hello")).await;
            receiver.on_fragment(FragCount::new(1, true), Bytes::from_static(b"x")).await;

            for (expected_payload, expected_last) in expected {
                let fragment = receiver.receive(max_len).await.unwrap();
                assert_eq!(fragment.seq, 0);
                assert_eq!(fragment.payload.as_ref(), expected_payload.as_slice());
                assert_eq!(fragment.is_last, expected_last);
            }
            assert_eq!(receiver.receive(max_len).await.unwrap().seq, 1);
        });
    }

    #[test]
    fn test_receive_waits_for_gap() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (receiver, _) = active_receiver(16).await;
            let receiver = Arc::new(receiver);
            deliver(&receiver, 1).await;

            let receiver2 = receiver.clone();
            let pending = tokio::spawn(async move { receiver2.receive(100).await });

            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(!pending.is_finished());

            deliver(&receiver, 0).await;
            assert_eq!(pending.await.unwrap().unwrap().seq, 0);
            assert_eq!(receiver.receive(100).await.unwrap().seq, 1);
        });
    }

    #[test]
    fn test_close_wakes_receive() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (receiver, _) = active_receiver(16).await;
            let receiver = Arc::new(receiver);

            let receiver2 = receiver.clone();
            let pending = tokio::spawn(async move { receiver2.receive(100).await });
            tokio::time::sleep(Duration::from_millis(10)).await;

            let final_ack = receiver.begin_close().await;
            assert_eq!(final_ack.map(|e| e.partner_index), Some(PARTNER_INDEX));
            assert!(matches!(pending.await.unwrap(), Err(ReliableError::ConnectionClosed)));
            assert_eq!(receiver.state().await, ReceiverState::Closing);

            // a closing receiver still acknowledges
            assert!(deliver(&receiver, 0).await.is_none());
            assert_eq!(receiver.current_ack().await.next_contiguous, 1);
            assert_eq!(receiver.begin_close().await, None);
        });
    }

    #[test]
    fn test_teardown_reason() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (receiver, _) = active_receiver(16).await;
            deliver(&receiver, 0).await;

            receiver.teardown(CloseReason::RetransmitBudgetExceeded { seq: 3, budget: 5 }).await;
            receiver.teardown(CloseReason::ChannelClosed).await;

            assert!(matches!(receiver.receive(100).await, Err(ReliableError::RetransmitBudgetExceeded { seq: 3, budget: 5 })));
            assert_eq!(deliver(&receiver, 1).await, None);
            assert_eq!(receiver.stats().await.num_fragments_received, 1);
            assert_eq!(receiver.sweep_ack().await, None);
        });
    }

    #[test]
    fn test_awaiting_connect_drops_fragments() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let receiver = ReliableReceiver::new(16, PARTNER_INDEX, Arc::new(PiggybackSlot::default()));
            assert_eq!(receiver.state().await, ReceiverState::AwaitingConnect);
            deliver(&receiver, 0).await;
            assert_eq!(receiver.current_ack().await.next_contiguous, 0);

            receiver.activate().await;
            deliver(&receiver, 0).await;
            assert_eq!(receiver.current_ack().await.next_contiguous, 1);
        });
    }

    #[test]
    fn test_far_future_fragment_is_queued() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (receiver, _) = active_receiver(4).await;
            deliver(&receiver, 100).await;
            assert_eq!(receiver.current_ack().await, AckBlock { next_contiguous: 0, received_beyond: 0 });

            for seq in 0..100 {
                deliver(&receiver, seq).await;
            }
            assert_eq!(receiver.current_ack().await.next_contiguous, 101);
        });
    }
}
