use std::fmt;
use std::io;

use m2mp_channel::ChannelError;
use m2mp_layer::LayerError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::AddrInUse
        | io::ErrorKind::BrokenPipe => TRANSPORT_ERROR,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn channel_error(context: &str, err: ChannelError) -> CliError {
    match err {
        ChannelError::Bind { source, .. }
        | ChannelError::Connect { source, .. }
        | ChannelError::Accept(source)
        | ChannelError::Io(source) => io_error(context, source),
        ChannelError::UnknownChannel(_) => CliError::new(USAGE, format!("{context}: {err}")),
        ChannelError::Closed => CliError::new(FAILURE, format!("{context}: {err}")),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn layer_error(context: &str, err: LayerError) -> CliError {
    match err {
        LayerError::Channel(err) => channel_error(context, err),
        LayerError::Io(err) => io_error(context, err),
        LayerError::InvalidConfig(_) => CliError::new(USAGE, format!("{context}: {err}")),
        LayerError::FilterTooLong { .. } => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        LayerError::Closed => CliError::new(FAILURE, format!("{context}: {err}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}
