use std::fmt;
use std::io;

/// Failure parsing or validating one of the startup config files. Callers
/// log it and fall back to an empty/default config rather than aborting.
#[derive(Debug)]
pub enum ConfigError {
    Io(String, io::Error),
    Toml(String, toml::de::Error),
    InvalidAddress(String, String),
    InvalidPrefix(String, u8),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Io(path, err) => write!(f, "could not read {}: {}", path, err),
            ConfigError::Toml(path, err) => write!(f, "could not parse {}: {}", path, err),
            ConfigError::InvalidAddress(field, value) => {
                write!(f, "invalid address for {}: {:?}", field, value)
            }
            ConfigError::InvalidPrefix(field, prefix) => {
                write!(f, "invalid prefix length for {}: {}", field, prefix)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Failure writing to or reading from the TAP device. Opening the TAP
/// device is the one startup failure that is fatal and propagates to
/// `main` rather than being absorbed locally.
#[derive(Debug)]
pub enum TapError {
    Open(io::Error),
    Ioctl(String, io::Error),
    Read(io::Error),
    Write(io::Error),
    ChannelClosed,
}

impl fmt::Display for TapError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TapError::Open(err) => write!(f, "failed to open TAP device: {}", err),
            TapError::Ioctl(call, err) => write!(f, "ioctl {} failed: {}", call, err),
            TapError::Read(err) => write!(f, "TAP read failed: {}", err),
            TapError::Write(err) => write!(f, "TAP write failed: {}", err),
            TapError::ChannelClosed => write!(f, "TAP dispatcher channel closed"),
        }
    }
}

impl std::error::Error for TapError {}

impl From<io::Error> for TapError {
    fn from(err: io::Error) -> Self {
        TapError::Open(err)
    }
}

/// Errors raised while sending messages on a switch connection. The
/// connection lifecycle itself is an external collaborator; this crate
/// only needs to know that a send failed so it can log and move on.
#[derive(Debug)]
pub enum OpenFlowError {
    UnknownSwitch(u64),
    SendFailed(u64, String),
}

impl fmt::Display for OpenFlowError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OpenFlowError::UnknownSwitch(dpid) => write!(f, "unknown switch dpid={:#x}", dpid),
            OpenFlowError::SendFailed(dpid, reason) => {
                write!(f, "send to switch dpid={:#x} failed: {}", dpid, reason)
            }
        }
    }
}

impl std::error::Error for OpenFlowError {}

/// Aggregate error type so `main` has a single type to match on.
#[derive(Debug)]
pub enum ControllerError {
    Config(ConfigError),
    Tap(TapError),
    OpenFlow(OpenFlowError),
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ControllerError::Config(err) => write!(f, "{}", err),
            ControllerError::Tap(err) => write!(f, "{}", err),
            ControllerError::OpenFlow(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for ControllerError {}

impl From<ConfigError> for ControllerError {
    fn from(err: ConfigError) -> Self {
        ControllerError::Config(err)
    }
}

impl From<TapError> for ControllerError {
    fn from(err: TapError) -> Self {
        ControllerError::Tap(err)
    }
}

impl From<OpenFlowError> for ControllerError {
    fn from(err: OpenFlowError) -> Self {
        ControllerError::OpenFlow(err)
    }
}
