use crate::frame_header::DataFrameHeader;
use anyhow::bail;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct ReliableConfig {
    /// This is the maximum number of fragments (not bytes) that a sender may have in flight
    ///  without acknowledgement. It is the value this side offers during connection setup: the
    ///  effective window of a connection is the smaller of this and the peer's offer.
    ///
    /// Only the first 64 fragments beyond a receiver's contiguous cursor can be acknowledged
    ///  selectively, so windows bigger than that work but fall back to cumulative acks for
    ///  the excess.
    pub window_size: u32,

    /// A sent fragment that is not acknowledged within this time is retransmitted. This is a
    ///  fixed value rather than something derived from round trip measurements, and it should
    ///  be set to a small multiple of the expected round trip time.
    pub retransmit_timeout: Duration,

    /// Number of times a single fragment is retransmitted before the peer is considered
    ///  unreachable and the connection fails
    pub max_retransmits: u32,

    /// Interval at which the sweeper checks for retransmissions, flushes pending acks and
    ///  finishes closing connections. This limits the granularity of `retransmit_timeout`.
    pub sweep_interval: Duration,

    /// After a connection is closed, its state lingers this long at most to allow trailing
    ///  acks to arrive
    pub shutdown_delay: Duration,

    /// This is the number of frame buffers that will be pooled at a given time - buffers in
    ///  excess of this number are discarded when they are returned.
    pub buffer_pool_size: usize,
}

impl ReliableConfig {
    pub const MAX_WINDOW_SIZE: u32 = 1 << 16;

    /// Defaults for a local network with sub-millisecond round trips
    pub fn default_lan() -> ReliableConfig {
        ReliableConfig {
            window_size: 64,
            retransmit_timeout: Duration::from_millis(200),
            max_retransmits: 20,
            sweep_interval: Duration::from_millis(20),
            shutdown_delay: Duration::from_secs(1),
            buffer_pool_size: 256,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        Self::validate_window_size(self.window_size)?;
        if self.retransmit_timeout.is_zero() {
            bail!("retransmit timeout must be positive");
        }
        if self.sweep_interval.is_zero() {
            bail!("sweep interval must be positive");
        }
        if self.max_retransmits == 0 {
            bail!("retry budget must allow at least one retransmission");
        }
        Ok(())
    }

    fn validate_window_size(window_size: u32) -> anyhow::Result<()> {
        if window_size == 0 {
            bail!("window size must be positive");
        }
        if window_size > Self::MAX_WINDOW_SIZE {
            bail!("window size {} exceeds the maximum of {}", window_size, Self::MAX_WINDOW_SIZE);
        }
        Ok(())
    }
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self::default_lan()
    }
}

/// Configuration for a single connection, combining the [ReliableConfig] with the frame
///  channel's properties and the results of connection setup
#[derive(Clone, Debug)]
pub struct EffectiveConnectionConfig {
    pub window_size: u32,
    pub mtu: usize,
    pub header_offset: usize,
    /// payload bytes per fragment, i.e. what is left of a frame after the channel's header and
    ///  the data frame header
    pub max_payload_len: usize,
    pub retransmit_timeout: Duration,
    pub max_retransmits: u32,
    pub shutdown_delay: Duration,
}

impl EffectiveConnectionConfig {
    pub fn new(config: &ReliableConfig, mtu: usize, header_offset: usize, negotiated_window_size: u32) -> anyhow::Result<EffectiveConnectionConfig> {
        ReliableConfig::validate_window_size(negotiated_window_size)?;

        let min_frame_len = header_offset + DataFrameHeader::SERIALIZED_LEN;
        if mtu <= min_frame_len {
            bail!("MTU of {} leaves no room for payload after {} header bytes", mtu, min_frame_len);
        }

        Ok(EffectiveConnectionConfig {
            window_size: config.window_size.min(negotiated_window_size),
            mtu,
            header_offset,
            max_payload_len: mtu - min_frame_len,
            retransmit_timeout: config.retransmit_timeout,
            max_retransmits: config.max_retransmits,
            shutdown_delay: config.shutdown_delay,
        })
    }
}
