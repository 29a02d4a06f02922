pub const ETHERNET_MTU: usize = 1500;
pub const FDDI_MTU: usize = 4352;
pub const PPP_MTU: usize = 296;
pub const TUN_SIZE: usize = 4;
pub const TCP_HEADER_MAXIMUM_SIZE: usize = 20;
pub const IP_HEADER_MAXIMUM_SIZE: usize = 20;
pub const TCP_IP_PAYLOAD_MAXIMUM_SIZE: usize =
    ETHERNET_MTU - TCP_HEADER_MAXIMUM_SIZE - IP_HEADER_MAXIMUM_SIZE;

/// Capacity of every bounded inbound/outbound/accept queue.
pub const CONN_CHAN_BUF_SIZE: usize = 1024;
/// Seconds of inactivity after which a CONNECTED connection is evicted.
pub const CONN_TIMEOUT: u64 = 60;
/// Scratch buffer size used by the close handshake's non-blocking reads.
pub const BUFFER_SIZE: usize = 65536;
/// Number of retransmit attempts during dial / close handshakes.
pub const RETRY_TIME: u32 = 5;
/// Spacing, in milliseconds, between retransmit attempts.
pub const RETRY_INTERVAL_MS: u64 = 200;

/// Lowest ephemeral port handed out by `Dial`.
pub const EPHEMERAL_PORT_LOW: u16 = 32768;
/// Highest ephemeral port handed out by `Dial`.
pub const EPHEMERAL_PORT_HIGH: u16 = 60999;

/// SEQ/ACK pinned to this value in every emitted segment. Pseudo-TCP does
/// not track real sequence numbers; see DESIGN.md.
pub const FIXED_SEQ_ACK: u32 = 1;
/// Fixed TCP window advertised in every emitted segment.
pub const FIXED_WINDOW_SIZE: u16 = 1024;
pub const DEFAULT_TIME_TO_LIVE: u8 = 64;
