//! Channel abstraction for the M2MP layer.
//!
//! A [`Channel`] sends and receives whole [`Packet`](m2mp_packet::Packet)s and
//! loops every transmitted packet back to its own receive side. Channels
//! compose as decorators: the [`FlowController`] wraps an external channel
//! and allows only one unconfirmed outgoing packet at a time.
//!
//! Provided implementations:
//! - [`NullChannel`]: loopback only, no external traffic
//! - [`MemoryHub`]: in-process broadcast medium for tests and embedding
//! - [`DaemonChannel`]: length-prefixed TCP link to a local M2MP daemon
//! - [`FlowController`]: window-of-one decorator over any channel

pub mod daemon;
pub mod error;
pub mod flow;
pub mod memory;
pub mod null;
pub mod registry;
pub mod traits;

pub use daemon::{encode_frame, DaemonChannel, LENGTH_PREFIX_SIZE};
pub use error::{ChannelError, Result};
pub use flow::FlowController;
pub use memory::{FrameRecord, MemoryChannel, MemoryHub};
pub use null::NullChannel;
pub use registry::{ChannelConstructor, ChannelRegistry};
pub use traits::{Channel, Verbosity};
