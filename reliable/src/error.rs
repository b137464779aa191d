use std::fmt::{Display, Formatter};

/// Errors surfaced by connections and frame channels.
#[derive(Debug, thiserror::Error)]
pub enum ReliableError {
    /// The connection was closed locally or the frame channel reported it as closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// A fragment was re-sent as often as the configured retry budget allows without being
    ///  acknowledged, so the peer is considered unreachable.
    #[error("fragment #{seq} was not acknowledged after {budget} retransmissions")]
    RetransmitBudgetExceeded { seq: u32, budget: u32 },

    /// The connection ran out of 31 bit sequence numbers.
    #[error("sequence numbers exhausted")]
    SequenceExhausted,

    /// A non-blocking frame channel operation could not proceed right now.
    #[error("frame channel would block")]
    WouldBlock,

    #[error("frame of {len} bytes exceeds the MTU of {mtu} bytes")]
    FrameTooLarge { len: usize, mtu: usize },

    #[error("frame channel I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ReliableError>;

/// Why a connection stopped accepting calls. This is stored with connection state so that
///  every call after the fact fails with the same error.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum CloseReason {
    Closed,
    ChannelClosed,
    RetransmitBudgetExceeded { seq: u32, budget: u32 },
    SequenceExhausted,
}

impl CloseReason {
    pub fn to_error(self) -> ReliableError {
        match self {
            CloseReason::Closed | CloseReason::ChannelClosed => ReliableError::ConnectionClosed,
            CloseReason::RetransmitBudgetExceeded { seq, budget } => ReliableError::RetransmitBudgetExceeded { seq, budget },
            CloseReason::SequenceExhausted => ReliableError::SequenceExhausted,
        }
    }
}

impl Display for CloseReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Closed => write!(f, "closed"),
            CloseReason::ChannelClosed => write!(f, "frame channel closed"),
            CloseReason::RetransmitBudgetExceeded { seq, budget } => write!(f, "fragment #{} exceeded {} retransmissions", seq, budget),
            CloseReason::SequenceExhausted => write!(f, "sequence numbers exhausted"),
        }
    }
}
