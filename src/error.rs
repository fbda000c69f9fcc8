//! Error types for the port bridge

use thiserror::Error;

/// Bridge error types
///
/// Creation and registry errors are returned synchronously to the caller and
/// never retried. Channel-originated errors observed while an open is in
/// progress are stored on the device and returned once the wait completes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// No port with the given id, or the port has been released
    #[error("no such port")]
    NotFound,

    /// A specific port id was requested but is already taken
    #[error("port id {0} already in use")]
    AddressInUse(u16),

    /// No free port id in range, or the requested id is out of range
    #[error("too many ports")]
    TooManyPorts,

    /// Privileged operation attempted without authorization
    #[error("permission denied")]
    PermissionDenied,

    /// Operation requires a precondition that does not hold
    #[error("invalid state: {0}")]
    BadState(&'static str),

    /// The channel reported a connect or send failure
    #[error("channel error: {0}")]
    Transport(String),

    /// The channel closed without reporting a specific error
    #[error("channel closed")]
    ChannelClosed,

    /// A blocking open was cancelled by an interrupt signal
    #[error("interrupted")]
    Interrupted,

    /// Malformed endpoint address string
    #[error("invalid endpoint address: {0}")]
    InvalidAddress(String),
}
