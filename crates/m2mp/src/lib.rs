//! Many-to-many messaging over unreliable broadcast channels.
//!
//! M2MP lets any number of processes exchange messages of any length over a
//! shared broadcast medium. Messages are split into fragments of at most
//! 500 bytes, each fragment may be sent several times for redundancy, and
//! receivers pick the messages they care about by payload prefix.
//!
//! # Crate Structure
//!
//! - [`packet`]: Packet wire format and the packet pool
//! - [`channel`]: Channel abstraction, flow control, daemon link, registry
//! - [`layer`]: Message streams, filters, the `M2mp` facade and the daemon relay

/// Re-export packet types.
pub mod packet {
    pub use m2mp_packet::*;
}

/// Re-export channel types.
pub mod channel {
    pub use m2mp_channel::*;
}

/// Re-export message layer types.
pub mod layer {
    pub use m2mp_layer::*;
}

pub use m2mp_layer::{Daemon, IncomingMessage, LayerError, M2mp, M2mpConfig, MessageOutputStream};
