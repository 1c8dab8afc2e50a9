//! Fixed-layout M2MP packets and the pooled allocator that recycles them.
//!
//! This is the lowest layer of m2mp. Every datagram on the wire is a
//! [`Packet`]:
//! - A 4-byte big-endian message ID
//! - A 4-byte big-endian word holding the last-packet flag (top bit) and
//!   the 31-bit fragment number
//! - Up to 500 bytes of message payload
//!
//! Packets are recycled through a [`PacketPool`] instead of being freed.

pub mod error;
pub mod packet;
pub mod pool;

pub use error::{PacketError, Result};
pub use packet::{
    hex, Packet, DATA_SIZE, HEADER_SIZE, MAXIMUM_SIZE, MAX_FRAGMENT_NUMBER, MIN_SIZE,
};
pub use pool::PacketPool;
