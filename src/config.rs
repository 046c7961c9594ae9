use anyhow::bail;
use std::time::Duration;

/// Configuration of the session transport layer. One instance is shared by all channels of a
///  connection; the values are negotiated out-of-band (or defaulted) and fixed for the lifetime
///  of the connection.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// The upper bound for a single framed message body. A frame whose length prefix exceeds this
    ///  is treated as evidence of a corrupted or hostile stream, and decoding fails hard rather
    ///  than attempting to resynchronize: once framing is lost, every subsequent byte would be
    ///  misinterpreted.
    pub max_frame_size: u32,

    /// The number of bytes a channel asks its transport for in a single read. Stream transports
    ///  do not report how much data is ready, so reads are bounded by this fixed chunk size and
    ///  repeated until the transport has nothing more to deliver.
    pub read_chunk_size: usize,

    pub heartbeat: HeartbeatConfig,
}

impl TransportConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_frame_size == 0 {
            bail!("max frame size must be positive");
        }
        if self.read_chunk_size == 0 {
            bail!("read chunk size must be positive");
        }
        if self.heartbeat.initial_interval < self.heartbeat.min_interval {
            bail!("initial heartbeat interval is below the configured minimum");
        }
        Ok(())
    }
}

impl Default for TransportConfig {
    fn default() -> TransportConfig {
        TransportConfig {
            max_frame_size: 16 * 1024 * 1024,
            read_chunk_size: 4096,
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// The liveness interval used until the peer directs otherwise.
    pub initial_interval: Duration,

    /// Lower clamp for peer-directed intervals. A peer cannot make this host flood the
    ///  request/response channel by directing an arbitrarily small interval.
    pub min_interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> HeartbeatConfig {
        HeartbeatConfig {
            initial_interval: Duration::from_secs(5 * 60),
            min_interval: Duration::from_secs(1),
        }
    }
}
