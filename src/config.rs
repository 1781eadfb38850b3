use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::bail;

/// The protocol version carried in every membership datagram. Values above 255 are never
/// used: the high byte of the two-byte field stays zero, so a peer reading the field with
/// the wrong byte order sees an unknown version and drops the datagram.
pub const PROTOCOL_VERSION: u16 = 0;

/// Maximum number of `{start, end}` ranges in a single NACK datagram, chosen so the whole
/// NACK fits into one IP frame.
pub const MAX_NACKS: usize = 300;

/// Configuration for one multicast group endpoint and the objects distributed over it.
///
/// The defaults are tuned for a quiet, multicast-capable LAN. `mtu` must be identical on all
/// nodes of a group since it determines the wire layout of data datagrams; `num_buffers`
/// bounds both memory use and the sequence window and must also be replicated.
#[derive(Debug, Clone)]
pub struct Config {
    /// Multicast group address of the RSP session.
    pub group_addr: Ipv4Addr,
    /// UDP port of the RSP session. Must be identical on all nodes.
    pub port: u16,
    /// Local interface to join the group on.
    pub interface: Ipv4Addr,

    /// Maximum datagram size, including the 8-byte data header.
    pub mtu: usize,
    /// Configured bandwidth ceiling in KB/s; the send rate never exceeds this.
    pub bandwidth_kbps: i64,
    /// ACK cadence: a reader acknowledges roughly every `ack_freq` in-order packets.
    pub ack_freq: u16,
    /// Number of pooled MTU-sized buffers per connection. Also the sequence window size.
    pub num_buffers: u16,
    /// Interval after which a writer with unacknowledged data requests an ACK.
    pub ack_timeout: Duration,
    /// Number of unanswered ACK requests after which the writer gives up on its laggards.
    pub max_timeouts: u32,
    /// Send rate increase per sent packet, in thousandths of the configured bandwidth.
    pub error_upscale_permille: i64,
    /// Send rate decrease per lost packet, in thousandths of the current rate.
    pub error_downscale_permille: i64,
    /// Cap for the slow-down applied by a single NACK burst, in percent.
    pub error_max_scale_percent: i64,
    /// The send rate never drops below `bandwidth_kbps >> min_send_rate_shift`.
    pub min_send_rate_shift: u32,
    /// Coalesce consecutive small writes into one datagram.
    pub merge_writes: bool,

    /// Default timeout for blocking reads and writes; `None` blocks indefinitely.
    pub default_timeout: Option<Duration>,
    /// Idle keepalive used by stream-oriented connection types; RSP traffic is kept alive by
    /// its own ACK request cadence.
    pub keepalive: Duration,
    /// Back-pressure bound for queued inbound commands per node link.
    pub command_queue_limit: usize,

    /// Flush threshold of an object data output stream: payloads are cut into commands of at
    /// most this many bytes.
    pub object_buffer_size: usize,
    /// Payloads at or above this size go through the configured compressor.
    pub compression_threshold: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            group_addr: Ipv4Addr::new(239, 255, 42, 43),
            port: 4242,
            interface: Ipv4Addr::UNSPECIFIED,
            mtu: 1400,
            bandwidth_kbps: 102_400,
            ack_freq: 64,
            num_buffers: 256,
            ack_timeout: Duration::from_millis(20),
            max_timeouts: 1000,
            error_upscale_permille: 1,
            error_downscale_permille: 5,
            error_max_scale_percent: 50,
            min_send_rate_shift: 3,
            merge_writes: true,
            default_timeout: None,
            keepalive: Duration::from_millis(2000),
            command_queue_limit: 64 * 1024,
            object_buffer_size: 60_000,
            compression_threshold: 4096,
        }
    }
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mtu < crate::transport::datagram::DATA_HEADER_LEN + 1 {
            bail!("mtu of {} leaves no room for a payload", self.mtu);
        }
        if self.mtu > u16::MAX as usize {
            bail!("mtu of {} exceeds the 16-bit datagram size field", self.mtu);
        }
        if self.max_nack_ranges() == 0 {
            bail!("mtu of {} leaves no room for NACK ranges", self.mtu);
        }
        if self.num_buffers == 0 {
            bail!("at least one buffer is required");
        }
        if self.num_buffers > u16::MAX / 2 {
            bail!("num_buffers must leave room for wrap-around sequence arithmetic");
        }
        if self.bandwidth_kbps <= 0 {
            bail!("bandwidth must be positive");
        }
        if self.ack_freq == 0 {
            bail!("ack_freq must be positive");
        }
        Ok(())
    }

    /// Payload bytes available in a data datagram.
    pub fn payload_size(&self) -> usize {
        self.mtu - crate::transport::datagram::DATA_HEADER_LEN
    }

    /// NACK ranges fitting into one datagram, capped at the wire-format maximum.
    pub fn max_nack_ranges(&self) -> usize {
        MAX_NACKS.min((self.mtu.saturating_sub(8)) / 4)
    }

    /// Token bucket capacity in bytes.
    pub fn max_bucket_size(&self) -> u64 {
        (self.mtu as u64 * self.ack_freq as u64) / 2
    }
}
