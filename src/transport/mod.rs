//! Transport Abstraction
//!
//! Seam between the session core and the OS Bluetooth stack. The stack is
//! an external collaborator providing raw discover/bond/connect/send
//! primitives plus adapter power-state notifications; everything above it
//! (state machine, buffering, timeouts) lives in this crate.
//!
//! Variants are selected at construction, not per-platform `cfg`:
//!
//! - [`mock::MockTransport`] — in-memory simulated stack for tests and
//!   development
//! - [`unsupported::UnsupportedTransport`] — capability-gap stand-in for
//!   platforms without Classic Bluetooth

pub mod mock;
pub mod unsupported;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::adapter::AdapterPowerState;
use crate::error::Result;
use crate::registry::Device;

/// Reserved UUID for the Classic Bluetooth serial port profile.
pub const SPP_UUID: &str = "00001101-0000-1000-8000-00805F9B34FB";

/// Outcome of a permission query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionStatus {
    Granted,
    Denied,
    /// Not yet decided; `request_permissions` may surface a prompt.
    Prompt,
}

/// An open RFCOMM link to one remote device.
#[async_trait]
pub trait TransportLink: Send + Sync {
    /// Transmit one payload. Atomic-or-failed; partial-write handling is
    /// the transport's concern.
    async fn send(&self, data: &[u8]) -> Result<()>;

    /// Release the link. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Result of opening a connection: the outbound half plus the stream of
/// inbound byte chunks. The stream ends when the link goes away.
pub struct OpenedLink {
    pub link: Box<dyn TransportLink>,
    pub inbound: mpsc::Receiver<Vec<u8>>,
}

/// External Bluetooth stack primitives consumed by the session core.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a discovery window. Raw device records arrive on the returned
    /// channel; the sender side is dropped once the window elapses.
    async fn discover(&self, duration: Duration) -> Result<mpsc::Receiver<Device>>;

    /// OS-level bonding with the addressed device.
    async fn bond(&self, address: &str) -> Result<()>;

    /// Open an RFCOMM link to the addressed device.
    async fn open(&self, address: &str) -> Result<OpenedLink>;

    /// Current adapter power state.
    async fn adapter_state(&self) -> Result<AdapterPowerState>;

    /// Adapter power-state change feed. Single consumer; a second call
    /// returns an already-closed channel.
    fn adapter_events(&self) -> mpsc::UnboundedReceiver<AdapterPowerState>;

    /// Ask the OS to enable the adapter. On platforms where programmatic
    /// enabling is disallowed this merely reports the current state; it
    /// must not block indefinitely.
    async fn request_enable(&self) -> Result<AdapterPowerState>;

    async fn check_permissions(&self) -> Result<PermissionStatus>;

    async fn request_permissions(&self) -> Result<PermissionStatus>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spp_uuid_is_the_reserved_serial_port_uuid() {
        // Base UUID suffix with the 0x1101 SerialPort service class,
        // hex digits uppercased as the stack reports them.
        assert_eq!(SPP_UUID, "00001101-0000-1000-8000-00805F9B34FB");
        assert_eq!(SPP_UUID, SPP_UUID.to_ascii_uppercase());
    }
}
