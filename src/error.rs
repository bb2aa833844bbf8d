//! Error kinds surfaced by the datapath's public API.
//!
//! Packet-path failures never reach here — they are counted and dropped
//! where they happen. This enum is for control-path calls: bind/close,
//! peer add/remove/teardown, and the control endpoint's read/write/ioctl.

use std::fmt;

#[derive(Debug)]
pub enum CoreError {
    /// Malformed ioctl size/direction, or an address missing what the
    /// operation requires (unspecified host, zero port, ...).
    InvalidArgument(&'static str),
    /// No bound socket exists to satisfy a bind or an add_peer.
    AddressNotAvailable,
    /// The requested remote endpoint is already held by another peer, or
    /// the peer being targeted is already in teardown.
    Busy,
    /// Lookup by local or remote endpoint found nothing.
    NotFound,
    /// Allocation failed on the packet path.
    OutOfBuffers,
    /// Output attempted on an interface that is not running.
    NetworkDown,
    /// A socket or device I/O call failed.
    Io(std::io::Error),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::InvalidArgument(why) => write!(f, "invalid argument: {why}"),
            CoreError::AddressNotAvailable => write!(f, "address not available"),
            CoreError::Busy => write!(f, "busy"),
            CoreError::NotFound => write!(f, "not found"),
            CoreError::OutOfBuffers => write!(f, "out of buffers"),
            CoreError::NetworkDown => write!(f, "network down"),
            CoreError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CoreError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Io(e)
    }
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// Glue-code error type (config loading, CLI, device setup) that does not
/// need to be matched on by variant, matching the boxed-error convention
/// used at the edges of the crate.
pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;
