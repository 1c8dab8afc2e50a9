use m2mp_packet::Packet;

use crate::error::Result;

/// A packet transport shared by the M2MP layer's threads.
///
/// Every implementation must:
/// - Block in [`receive_packet`](Self::receive_packet) until a packet arrives.
/// - Loop back: a copy of each packet passed to
///   [`transmit_packet`](Self::transmit_packet) must eventually come out of
///   this same instance's `receive_packet`, unless a decorator in the chain
///   consumes it as a delivery confirmation.
/// - Allow concurrent senders and one receiver on different threads.
///
/// Received packets come from the channel's packet pool and belong to the
/// caller. Transmitted packets stay owned by the caller.
///
/// Channels compose in a pipeline: outgoing packets traverse the decorators
/// outward, incoming packets come back through the same chain inward.
pub trait Channel: Send + Sync {
    /// Receive the next packet (blocking).
    fn receive_packet(&self) -> Result<Packet>;

    /// Transmit the valid bytes of `packet`.
    fn transmit_packet(&self, packet: &Packet) -> Result<()>;

    /// Close the channel. Blocked and later calls fail with
    /// [`ChannelError::Closed`](crate::ChannelError::Closed) or an I/O error.
    fn close(&self);

    /// Channel name for diagnostics.
    fn name(&self) -> &'static str;
}

/// Diagnostic verbosity level, 0 (quiet) through 2 (detailed).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Verbosity(u8);

impl Verbosity {
    pub const QUIET: Verbosity = Verbosity(0);
    pub const SUMMARY: Verbosity = Verbosity(1);
    pub const DETAILED: Verbosity = Verbosity(2);

    /// Returns `None` for levels above 2.
    pub fn new(level: u8) -> Option<Self> {
        (level <= 2).then_some(Self(level))
    }

    pub fn level(self) -> u8 {
        self.0
    }

    /// At least summary diagnostics are enabled.
    pub fn summary(self) -> bool {
        self.0 >= 1
    }

    /// Detailed diagnostics are enabled.
    pub fn detailed(self) -> bool {
        self.0 >= 2
    }
}
