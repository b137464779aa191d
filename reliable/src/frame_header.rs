use crate::ack::AckBlock;
use crate::frag_count::FragCount;
use anyhow::bail;
use bytes::{Buf, BufMut, Bytes};

/// The routing part of an ack as it travels between processes: `partner_index` identifies
///  the sender (in the process receiving the frame) that the ack refers to.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct PiggybackEnvelope {
    pub partner_index: u32,
    pub ack: AckBlock,
}

impl PiggybackEnvelope {
    pub const SERIALIZED_LEN: usize = 4 + AckBlock::SERIALIZED_LEN;

    /// partner index of data frames that do not carry an ack
    pub const NO_PARTNER: u32 = u32::MAX;

    pub const EMPTY: PiggybackEnvelope = PiggybackEnvelope {
        partner_index: Self::NO_PARTNER,
        ack: AckBlock {
            next_contiguous: 0,
            received_beyond: 0,
        },
    };

    pub fn is_empty(&self) -> bool {
        self.partner_index == Self::NO_PARTNER
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.partner_index);
        self.ack.ser(buf);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PiggybackEnvelope> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("envelope requires {} bytes, only {} remaining", Self::SERIALIZED_LEN, buf.remaining());
        }
        let partner_index = buf.get_u32();
        let ack = AckBlock::deser(buf)?;
        Ok(PiggybackEnvelope { partner_index, ack })
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct DataFrameHeader {
    pub frag_count: FragCount,
    pub envelope: PiggybackEnvelope,
}

impl DataFrameHeader {
    pub const SERIALIZED_LEN: usize = 4 + PiggybackEnvelope::SERIALIZED_LEN;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.frag_count.to_raw());
        self.envelope.ser(buf);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<DataFrameHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("data frame header requires {} bytes, only {} remaining", Self::SERIALIZED_LEN, buf.remaining());
        }
        let frag_count = FragCount::from_raw(buf.get_u32());
        let envelope = PiggybackEnvelope::deser(buf)?;
        Ok(DataFrameHeader { frag_count, envelope })
    }
}

/// A frame as seen by the reliability layer, i.e. with the frame channel's own header
///  already stripped
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum Frame {
    Data {
        header: DataFrameHeader,
        payload: Bytes,
    },
    Control(PiggybackEnvelope),
}

impl Frame {
    /// Control frames have exactly the length of an envelope, data frames are at least as long
    ///  as their header. Anything in between is malformed.
    pub fn parse(mut buf: Bytes) -> anyhow::Result<Frame> {
        if buf.len() == PiggybackEnvelope::SERIALIZED_LEN {
            return Ok(Frame::Control(PiggybackEnvelope::deser(&mut buf)?));
        }
        if buf.len() < DataFrameHeader::SERIALIZED_LEN {
            bail!("frame of {} bytes is neither a control frame nor a data frame", buf.len());
        }

        let header = DataFrameHeader::deser(&mut buf)?;
        Ok(Frame::Data {
            header,
            payload: buf,
        })
    }
}
