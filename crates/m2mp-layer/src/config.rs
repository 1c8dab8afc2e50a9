use std::time::Duration;

use m2mp_channel::Verbosity;

use crate::error::{LayerError, Result};

/// Maximum length of a message filter prefix in bytes.
pub const MAX_FILTER_PREFIX: usize = 488;

/// Largest device identity that fits the 48-bit identifier space.
pub const MAX_DEVICE_ID: u64 = (1 << 48) - 1;

/// Independent verbosity levels for the layer's diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebugLevels {
    /// Receiver-thread failures, invalid frame lengths, flow timeouts.
    pub receiver_thread: Verbosity,
    /// Every packet sent and received.
    pub packets: Verbosity,
    /// Message filter registration.
    pub message_filters: Verbosity,
}

/// Configuration of one M2MP layer or daemon instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct M2mpConfig {
    /// How long a reader waits for the next fragment before aborting.
    pub message_timeout: Duration,
    /// How long a sender waits for its packet's loopback.
    pub flow_timeout: Duration,
    /// Number of times each fragment is transmitted.
    pub redundancy: u32,
    pub debug: DebugLevels,
    /// Local daemon port; 0 means use the external channel directly.
    pub daemon_port: u16,
    /// Registry name of the external channel.
    pub channel: String,
    /// 48-bit device identity, used only to seed message IDs.
    pub device_id: u64,
}

impl Default for M2mpConfig {
    fn default() -> Self {
        Self {
            message_timeout: Duration::from_secs(5),
            flow_timeout: Duration::from_millis(100),
            redundancy: 1,
            debug: DebugLevels::default(),
            daemon_port: 0,
            channel: "null".to_string(),
            device_id: 0,
        }
    }
}

impl M2mpConfig {
    /// Reject values the layer cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.message_timeout.is_zero() {
            return Err(LayerError::InvalidConfig(
                "message timeout must be greater than zero".to_string(),
            ));
        }
        if self.flow_timeout.is_zero() {
            return Err(LayerError::InvalidConfig(
                "flow timeout must be greater than zero".to_string(),
            ));
        }
        if self.redundancy == 0 {
            return Err(LayerError::InvalidConfig(
                "redundancy must be greater than zero".to_string(),
            ));
        }
        if self.device_id > MAX_DEVICE_ID {
            return Err(LayerError::InvalidConfig(format!(
                "device id {:#x} exceeds 48 bits",
                self.device_id
            )));
        }
        if self.daemon_port == 0 && self.channel.trim().is_empty() {
            return Err(LayerError::InvalidConfig(
                "external channel name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
