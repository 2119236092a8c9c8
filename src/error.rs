//! Error taxonomy for the session manager.
//!
//! Every public operation resolves to either a success value or one of
//! these kinds. Transport-level failures that have no dedicated kind are
//! wrapped in [`BtError::Transport`].

use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, BtError>;

#[derive(Debug, Error)]
pub enum BtError {
    /// Malformed caller input (empty delimiter, bad address, empty payload).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A session is already Connecting, Connected, or Disconnecting.
    #[error("a connection is already active")]
    AlreadyConnected,

    /// The operation requires an active connection.
    #[error("no active connection")]
    NotConnected,

    /// The transport did not confirm the connection in time.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The delimiter did not appear (or no data arrived) in time.
    /// Buffered bytes are left intact.
    #[error("read timed out after {0:?}")]
    ReadTimeout(Duration),

    /// The link went away while a read was pending.
    #[error("connection closed")]
    ConnectionClosed,

    /// A discovery window is already open.
    #[error("scan already in progress")]
    ScanInProgress,

    #[error("pairing failed: {0}")]
    PairingFailed(String),

    /// The remote device refused the bonding request.
    #[error("pairing rejected by the remote device")]
    PairingRejected,

    /// The underlying transport has not been initialized.
    #[error("bluetooth transport not initialized")]
    NotInitialized,

    /// Opaque failure surfaced by the external transport.
    #[error("transport error: {0}")]
    Transport(String),
}

impl BtError {
    /// Wrap an arbitrary transport-side failure.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }
}
