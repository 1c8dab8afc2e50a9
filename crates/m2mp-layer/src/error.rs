/// Errors that can occur in M2MP layer operations.
#[derive(Debug, thiserror::Error)]
pub enum LayerError {
    /// Channel-level error.
    #[error("channel error: {0}")]
    Channel(#[from] m2mp_channel::ChannelError),

    /// Packet-level error.
    #[error("packet error: {0}")]
    Packet(#[from] m2mp_packet::PacketError),

    /// A configuration value is missing or out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A message filter prefix exceeds the maximum length.
    #[error("message filter prefix too long ({len} bytes, max {max})")]
    FilterTooLong { len: usize, max: usize },

    /// The layer or queue has been shut down.
    #[error("m2mp layer closed")]
    Closed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LayerError>;
