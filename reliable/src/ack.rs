use crate::safe_converter::{PrecheckedCast, SafeCast};
use anyhow::bail;
use bytes::{Buf, BufMut};

/// An acknowledgement as it is embedded in data frames and sent in control frames.
///
/// `next_contiguous` is the receiver's contiguous cursor: all fragments with a sequence number
///  below it were received. `received_beyond` reports fragments that arrived out of order after
///  the cursor: bit `i` is set if fragment `next_contiguous + i` was received. That allows the
///  sender to distinguish fragments that were lost from fragments that are merely overtaken.
///
/// Bit 0 is never set - if fragment `next_contiguous` had been received, the cursor would
///  have moved past it.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct AckBlock {
    pub next_contiguous: u32,
    pub received_beyond: u64,
}

impl AckBlock {
    pub const SERIALIZED_LEN: usize = 12;
    pub const BITSET_LEN: u32 = u64::BITS;
    const LOW_WORD_MASK: u64 = 0xFFFF_FFFF;

    /// Build an ack block for a given contiguous cursor. All sequence numbers greater than the
    ///  cursor and less than 64 positions beyond it are recorded, all others are ignored.
    ///  Fragments that are further ahead will be acknowledged once the cursor catches up.
    pub fn encode(next_contiguous: u32, received: impl IntoIterator<Item = u32>) -> AckBlock {
        let mut received_beyond = 0u64;
        for seq in received {
            if seq <= next_contiguous {
                continue;
            }
            let offset = seq - next_contiguous;
            if offset < Self::BITSET_LEN {
                received_beyond |= 1u64 << offset;
            }
        }

        AckBlock {
            next_contiguous,
            received_beyond,
        }
    }

    /// The inverse of [AckBlock::encode]: the contiguous cursor, and the sequence numbers that
    ///  were received beyond it, in ascending order
    pub fn decode(&self) -> (u32, Vec<u32>) {
        (self.next_contiguous, self.received_beyond_seqs().collect())
    }

    pub fn received_beyond_seqs(&self) -> impl Iterator<Item = u32> + '_ {
        (0..Self::BITSET_LEN)
            .filter(|&offset| self.received_beyond & (1u64 << offset) != 0)
            .filter_map(|offset| self.next_contiguous.checked_add(offset))
    }

    /// Checks an incoming ack against the sender's state. A sender must ignore an ack that
    ///  fails this check rather than apply part of it.
    ///
    /// * `window_size` is the connection's negotiated window - a receiver never has reason to
    ///    report fragments further beyond its cursor than that
    /// * `next_seq` is the sender's next unassigned sequence number, i.e. no fragment at or
    ///    above it can have been received
    pub fn validate(&self, window_size: u32, next_seq: u32) -> anyhow::Result<()> {
        if self.next_contiguous > next_seq {
            bail!("ack cursor {} is beyond the next fragment to be sent {}", self.next_contiguous, next_seq);
        }
        if self.received_beyond & 1 != 0 {
            bail!("ack reports the fragment at its own cursor {} as received", self.next_contiguous);
        }
        if self.received_beyond == 0 {
            return Ok(());
        }

        let highest_offset = Self::BITSET_LEN - 1 - self.received_beyond.leading_zeros();
        if highest_offset >= window_size {
            bail!("ack bit {} is beyond the window size {}", highest_offset, window_size);
        }
        match self.next_contiguous.checked_add(highest_offset) {
            Some(highest) if highest < next_seq => Ok(()),
            _ => bail!("ack reports fragment {}+{} as received, but it was never sent (next is {})", self.next_contiguous, highest_offset, next_seq),
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.next_contiguous);
        buf.put_u32((self.received_beyond & Self::LOW_WORD_MASK).prechecked_cast());
        buf.put_u32((self.received_beyond >> 32).prechecked_cast());
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<AckBlock> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("ack block requires {} bytes, only {} remaining", Self::SERIALIZED_LEN, buf.remaining());
        }

        let next_contiguous = buf.get_u32();
        let low: u64 = buf.get_u32().safe_cast();
        let high: u64 = buf.get_u32().safe_cast();
        Ok(AckBlock {
            next_contiguous,
            received_beyond: (high << 32) | low,
        })
    }
}
