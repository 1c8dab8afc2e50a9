use std::net::SocketAddr;

use m2mp_packet::PacketError;

/// Errors that can occur in channel operations.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// An I/O error occurred on the underlying transport.
    #[error("channel I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A packet could not be read or filled.
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// Failed to connect to the specified address.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// Failed to bind to the specified address.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// The channel has been closed.
    #[error("channel closed")]
    Closed,

    /// No channel is registered under the requested name.
    #[error("unknown channel {0:?}")]
    UnknownChannel(String),
}

impl From<ChannelError> for std::io::Error {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Io(io) | ChannelError::Accept(io) => io,
            ChannelError::Connect { source, .. } | ChannelError::Bind { source, .. } => source,
            ChannelError::Closed => {
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "channel closed")
            }
            other => std::io::Error::other(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;
