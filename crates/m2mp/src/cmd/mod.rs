use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};
use m2mp_channel::Verbosity;
use m2mp_layer::{DebugLevels, M2mpConfig};

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod daemon;
pub mod listen;
pub mod send;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the local relay daemon.
    Daemon(DaemonArgs),
    /// Send a single message.
    Send(SendArgs),
    /// Register message filters and print received messages.
    Listen(ListenArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, layer: &LayerArgs, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Daemon(args) => daemon::run(args, layer, format),
        Command::Send(args) => send::run(args, layer, format),
        Command::Listen(args) => listen::run(args, layer, format),
        Command::Version(args) => version::run(args),
    }
}

/// Layer settings shared by every subcommand.
#[derive(Args, Debug)]
pub struct LayerArgs {
    /// Reassembly timeout for incoming messages (e.g. 5s, 500ms).
    #[arg(long, env = "M2MP_MESSAGE_TIMEOUT", default_value = "5s", global = true)]
    pub message_timeout: String,
    /// Flow-control timeout for each outgoing packet.
    #[arg(long, env = "M2MP_FLOW_TIMEOUT", default_value = "100ms", global = true)]
    pub flow_timeout: String,
    /// Number of times each fragment is transmitted.
    #[arg(long, env = "M2MP_REDUNDANCY", default_value = "1", global = true)]
    pub redundancy: u32,
    /// 48-bit device identity used to seed message IDs.
    #[arg(long, env = "M2MP_DEVICE_ID", default_value = "0", global = true)]
    pub device_id: u64,
    /// Receiver-thread diagnostics (0-2).
    #[arg(long, env = "M2MP_DEBUG_RECEIVER_THREAD", default_value = "0", global = true,
          value_parser = clap::value_parser!(u8).range(0..=2))]
    pub debug_receiver_thread: u8,
    /// Per-packet diagnostics (0-2).
    #[arg(long, env = "M2MP_DEBUG_PACKETS", default_value = "0", global = true,
          value_parser = clap::value_parser!(u8).range(0..=2))]
    pub debug_packets: u8,
    /// Message filter diagnostics (0-2).
    #[arg(long, env = "M2MP_DEBUG_MESSAGE_FILTERS", default_value = "0", global = true,
          value_parser = clap::value_parser!(u8).range(0..=2))]
    pub debug_message_filters: u8,
}

impl LayerArgs {
    /// Build and validate the layer configuration.
    pub fn to_config(&self, daemon_port: u16, channel: &str) -> CliResult<M2mpConfig> {
        let config = M2mpConfig {
            message_timeout: parse_duration(&self.message_timeout)?,
            flow_timeout: parse_duration(&self.flow_timeout)?,
            redundancy: self.redundancy,
            debug: DebugLevels {
                receiver_thread: verbosity(self.debug_receiver_thread)?,
                packets: verbosity(self.debug_packets)?,
                message_filters: verbosity(self.debug_message_filters)?,
            },
            daemon_port,
            channel: channel.to_string(),
            device_id: self.device_id,
        };
        config
            .validate()
            .map_err(|err| crate::exit::layer_error("invalid settings", err))?;
        Ok(config)
    }
}

#[derive(Args, Debug)]
pub struct DaemonArgs {
    /// Local TCP port to listen on (127.0.0.1).
    #[arg(long, env = "M2MP_DAEMON_PORT")]
    pub port: u16,
    /// External channel to relay to.
    #[arg(long, env = "M2MP_CHANNEL", default_value = "null")]
    pub channel: String,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Raw string payload.
    #[arg(long, conflicts_with = "file")]
    pub data: Option<String>,
    /// Read payload from file.
    #[arg(long, conflicts_with = "data")]
    pub file: Option<PathBuf>,
    /// Connect to the local daemon on this port (0 = use the external channel).
    #[arg(long, env = "M2MP_DAEMON_PORT", default_value = "0")]
    pub daemon_port: u16,
    /// External channel to use when no daemon is configured.
    #[arg(long, env = "M2MP_CHANNEL", default_value = "null")]
    pub channel: String,
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    /// Accept messages starting with this prefix (repeatable). Default: all.
    #[arg(long = "prefix", value_name = "PREFIX")]
    pub prefixes: Vec<String>,
    /// Exit after receiving N messages.
    #[arg(long)]
    pub count: Option<usize>,
    /// Give up if no message arrives within this time (e.g. 10s).
    #[arg(long)]
    pub timeout: Option<String>,
    /// Connect to the local daemon on this port (0 = use the external channel).
    #[arg(long, env = "M2MP_DAEMON_PORT", default_value = "0")]
    pub daemon_port: u16,
    /// External channel to use when no daemon is configured.
    #[arg(long, env = "M2MP_CHANNEL", default_value = "null")]
    pub channel: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}

fn verbosity(level: u8) -> CliResult<Verbosity> {
    Verbosity::new(level)
        .ok_or_else(|| CliError::new(USAGE, format!("debug level must be 0-2, got {level}")))
}
