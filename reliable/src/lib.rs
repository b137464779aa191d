//! This crate is the reliability layer of a pluggable network stack: it turns an unreliable,
//!  packet-oriented 'frame channel' (raw sockets, shared-memory queues, UDP multiplexers, ...)
//!  into per-connection streams of fragments that are delivered in order, without gaps and
//!  without duplicates.
//!
//! ## Design goals
//!
//! * Selective repeat: only fragments that are actually missing are re-sent
//! * No per-packet round trip - the sender keeps up to a negotiated *window* of fragments in
//!   flight, blocking the application when the window is full
//! * Acknowledgements are compact (a contiguous cursor plus a 64 bit bitset) and ride inside
//!   data frames of the reverse-direction flow whenever possible ('piggybacking'), falling back
//!   to dedicated control frames
//! * The underlying frame channel may reorder, drop or duplicate frames; it must only deliver
//!   whole frames up to a known MTU
//! * There is no per-fragment timer - a single periodic *sweeper* drives retransmission and
//!   connection teardown for all connections
//! * Explicitly *not* in scope: congestion control, encryption, multi-path, connection
//!   handshakes. The handshake's results (window size, piggyback routing indices) are inputs.
//!
//! ## Frames
//!
//! All numbers are in network byte order (BE). The frame channel may reserve a header of
//!  its own at the start of each frame (`FrameChannel::header_offset`); the layouts below start
//!  after that reserved area.
//!
//! *Data frame*
//!
//! ```ascii
//!  0: fragment count (u32): bit 31 is the 'last fragment' marker, bits 0-30 the sequence
//!      number of this fragment in its connection
//!  4: partner index (u32): piggyback routing key, identifying (in the receiving process) the
//!      sender whose fragments the following ack refers to. 0xFFFF_FFFF if there is no ack.
//!  8: next contiguous (u32): all fragments below this sequence number were received
//! 12: received beyond (2 x u32): bit i is set if fragment 'next contiguous + i' was received.
//!      The first word holds bits 0-31, the second word bits 32-63.
//! 20: payload
//! ```
//!
//! *Control frame* (explicit ack)
//!
//! ```ascii
//!  0: partner index (u32)
//!  4: next contiguous (u32)
//!  8: received beyond (2 x u32)
//! ```
//!
//! A control frame is recognized by its length: it is exactly 16 bytes, while a data frame is
//!  at least 20 bytes long.
//!
//! ## Acknowledgements
//!
//! A receiver does not acknowledge every fragment. As long as fragments arrive in order, it
//!  reports progress roughly once per half window; out-of-order arrival (i.e. evidence of
//!  loss) and duplicates are reported right away, duplicates always in a dedicated control
//!  frame. An ack waits for an outgoing data frame only while the local side is in the middle
//!  of sending a message; otherwise it goes out as a control frame right away. Acks left behind,
//!  and progress that was held back, are flushed by the sweeper.
//!
//! ## Retransmission
//!
//! The sweeper re-sends every fragment that was sent, is not acknowledged and was last sent
//!  longer than the (fixed, configurable) retransmission timeout ago. Re-sent fragments keep
//!  their sequence number. A fragment that exceeds the retry budget fails its connection.

pub mod ack;
pub mod buffers;
pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod frag_count;
pub mod frame_header;
pub mod piggyback;
pub mod receiver;
pub mod safe_converter;
pub mod sender;
pub mod sweeper;
