//! Capability-Gap Transport
//!
//! Stand-in for platforms whose Bluetooth stack exposes no Classic
//! (RFCOMM/SPP) API. Every operation fails explicitly instead of
//! silently substituting a different radio mode; the session core stays
//! free of platform checks.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::adapter::AdapterPowerState;
use crate::error::{BtError, Result};
use crate::registry::Device;
use crate::transport::{OpenedLink, PermissionStatus, Transport};

const NOT_IMPLEMENTED: &str = "classic bluetooth is not implemented on this platform";

/// Transport variant that rejects every operation.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedTransport;

impl UnsupportedTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for UnsupportedTransport {
    async fn discover(&self, _duration: Duration) -> Result<mpsc::Receiver<Device>> {
        Err(BtError::transport(NOT_IMPLEMENTED))
    }

    async fn bond(&self, _address: &str) -> Result<()> {
        Err(BtError::transport(NOT_IMPLEMENTED))
    }

    async fn open(&self, _address: &str) -> Result<OpenedLink> {
        Err(BtError::transport(NOT_IMPLEMENTED))
    }

    async fn adapter_state(&self) -> Result<AdapterPowerState> {
        Err(BtError::NotInitialized)
    }

    fn adapter_events(&self) -> mpsc::UnboundedReceiver<AdapterPowerState> {
        let (_, rx) = mpsc::unbounded_channel();
        rx
    }

    async fn request_enable(&self) -> Result<AdapterPowerState> {
        Err(BtError::transport(NOT_IMPLEMENTED))
    }

    async fn check_permissions(&self) -> Result<PermissionStatus> {
        Ok(PermissionStatus::Denied)
    }

    async fn request_permissions(&self) -> Result<PermissionStatus> {
        Ok(PermissionStatus::Denied)
    }
}
