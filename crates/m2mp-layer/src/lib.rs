//! M2MP message layer.
//!
//! This is the "just works" layer. Applications create outgoing messages as
//! byte streams, register prefix filters, and accept incoming messages as
//! byte streams. Underneath, messages are split into numbered fragments,
//! sent with configurable redundancy, and reassembled per message ID.

pub mod config;
pub mod daemon;
pub mod error;
pub mod id;
pub mod input;
pub mod layer;
pub mod output;
pub mod queue;
pub mod router;

pub use config::{DebugLevels, M2mpConfig, MAX_FILTER_PREFIX};
pub use daemon::Daemon;
pub use error::{LayerError, Result};
pub use id::MessageIdGenerator;
pub use input::{IncomingMessage, MessageInputStream};
pub use layer::M2mp;
pub use output::MessageOutputStream;
pub use queue::MessageQueue;
pub use router::MessageRouter;
