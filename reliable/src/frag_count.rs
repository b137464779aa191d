use std::fmt::{Display, Formatter};

/// The 'fragment count' field of a data frame: a fragment's sequence number together with the
///  marker that it is the last fragment of an application-level message.
///
/// Sequence numbers are assigned per connection, starting at 0 and increasing by one for every
///  fragment. They never wrap around - with 31 bits, a connection can send 2^31 fragments.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct FragCount {
    seq: u32,
    is_last: bool,
}

impl Display for FragCount {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_last {
            write!(f, "#{} (last)", self.seq)
        }
        else {
            write!(f, "#{}", self.seq)
        }
    }
}

impl FragCount {
    pub const LAST_FRAGMENT_FLAG: u32 = 0x8000_0000;
    pub const MAX_SEQ: u32 = Self::LAST_FRAGMENT_FLAG - 1;

    pub fn new(seq: u32, is_last: bool) -> FragCount {
        assert!(seq <= Self::MAX_SEQ, "sequence number {} does not fit into 31 bits", seq);
        FragCount { seq, is_last }
    }

    pub fn from_raw(raw: u32) -> FragCount {
        FragCount {
            seq: raw & Self::MAX_SEQ,
            is_last: raw & Self::LAST_FRAGMENT_FLAG != 0,
        }
    }

    pub fn to_raw(&self) -> u32 {
        if self.is_last {
            self.seq | Self::LAST_FRAGMENT_FLAG
        }
        else {
            self.seq
        }
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn is_last(&self) -> bool {
        self.is_last
    }
}
