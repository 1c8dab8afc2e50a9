/// Errors that can occur while accessing packet contents.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    /// A read, write or skip would cross the packet's limit.
    #[error("packet access out of bounds (position {position}, length {len}, limit {limit})")]
    OutOfBounds {
        position: usize,
        len: usize,
        limit: usize,
    },

    /// A frame length outside the valid range of 8 to 508 bytes.
    #[error("invalid packet length {0} (must be 8..=508)")]
    InvalidLength(usize),
}

pub type Result<T> = std::result::Result<T, PacketError>;
