//! Connection Session
//!
//! Owns one serial link's lifecycle: the state machine, the inbound pump
//! feeding the session's [`ByteStreamBuffer`], and serialized outbound
//! writes.
//!
//! State machine:
//!
//! ```text
//! Idle --connect--> Connecting --success--> Connected
//!                   Connecting --failure/timeout--> Failed
//! Connected --disconnect | transport error--> Disconnecting --> Idle
//! Failed --acknowledge--> Idle
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::buffer::ByteStreamBuffer;
use crate::error::{BtError, Result};
use crate::registry::Device;
use crate::transport::{Transport, TransportLink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Failed,
}

/// One connection's lifecycle, buffer, and outbound half.
pub struct ConnectionSession {
    device: Device,
    state: Arc<Mutex<ConnectionState>>,
    buffer: Arc<ByteStreamBuffer>,
    /// Holding this lock across `send` is what serializes writes and
    /// preserves byte order on the wire. Shared with the inbound pump so
    /// the handle is released even when the remote side drops the link.
    link: Arc<AsyncMutex<Option<Box<dyn TransportLink>>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionSession {
    /// New session in Connecting state; `establish` completes or fails it.
    pub fn new(device: Device, buffer_capacity: usize) -> Self {
        Self {
            device,
            state: Arc::new(Mutex::new(ConnectionState::Connecting)),
            buffer: Arc::new(ByteStreamBuffer::new(buffer_capacity)),
            link: Arc::new(AsyncMutex::new(None)),
            pump: Mutex::new(None),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: ConnectionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }

    /// Open the transport link and start draining inbound bytes.
    ///
    /// On timeout or transport failure the session ends up in Failed and
    /// the corresponding error is returned.
    pub async fn establish(&self, transport: &Arc<dyn Transport>, timeout: Duration) -> Result<()> {
        let address = self.device.address.clone();
        info!(%address, "connecting");

        let opened = match tokio::time::timeout(timeout, transport.open(&address)).await {
            Ok(Ok(opened)) => opened,
            Ok(Err(e)) => {
                warn!(%address, error = %e, "connect failed");
                self.set_state(ConnectionState::Failed);
                return Err(e);
            }
            Err(_) => {
                warn!(%address, ?timeout, "connect timed out");
                self.set_state(ConnectionState::Failed);
                return Err(BtError::ConnectTimeout(timeout));
            }
        };

        *self.link.lock().await = Some(opened.link);

        // Inbound pump: every received chunk is appended until the
        // transport ends the stream.
        let mut inbound = opened.inbound;
        let buffer = self.buffer.clone();
        let state = self.state.clone();
        let link_slot = self.link.clone();
        let handle = tokio::spawn(async move {
            while let Some(chunk) = inbound.recv().await {
                buffer.append(&chunk);
            }
            // Stream ended outside of a local disconnect: the link is
            // gone. Wake pending reads, release the transport handle,
            // and reset so a new connect is allowed (Failed here is
            // transient, settling at Idle).
            buffer.close();
            if let Some(link) = link_slot.lock().await.take() {
                if let Err(e) = link.close().await {
                    warn!(error = %e, "transport close failed");
                }
            }
            let mut st = state.lock().unwrap_or_else(|e| e.into_inner());
            if *st == ConnectionState::Connected {
                warn!("link lost, session reset");
                *st = ConnectionState::Idle;
            }
        });
        *self.pump.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        self.set_state(ConnectionState::Connected);
        info!(%address, "connected");
        Ok(())
    }

    /// Send one payload. Valid only while Connected; writes are
    /// serialized, and one transient transport failure is retried before
    /// being surfaced.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(BtError::InvalidArgument("empty write payload".into()));
        }
        if self.state() != ConnectionState::Connected {
            return Err(BtError::NotConnected);
        }
        let guard = self.link.lock().await;
        let link = guard.as_ref().ok_or(BtError::NotConnected)?;
        match link.send(data).await {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!(error = %first, "send failed, retrying once");
                link.send(data).await
            }
        }
    }

    /// Drain whatever is buffered right now. Allowed after disconnect so
    /// no received bytes are lost.
    pub fn read_all(&self) -> Result<Vec<u8>> {
        self.ensure_readable()?;
        Ok(self.buffer.read_all())
    }

    /// Wait for at least one buffered byte, then drain.
    pub async fn read_some(&self, timeout: Duration) -> Result<Vec<u8>> {
        self.ensure_readable()?;
        self.buffer.read_some(timeout).await
    }

    /// Delimiter-bounded read; see [`ByteStreamBuffer::read_until`].
    pub async fn read_until(&self, delimiter: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        self.ensure_readable()?;
        self.buffer.read_until(delimiter, timeout).await
    }

    /// Reads are valid while Connected and while draining a closed
    /// buffer; a session that never got connected has nothing to read.
    fn ensure_readable(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Connecting | ConnectionState::Failed => Err(BtError::NotConnected),
            _ => Ok(()),
        }
    }

    /// Tear the link down. Idempotent: calling while already Idle (or
    /// mid-teardown) is a no-op success.
    pub async fn disconnect(&self) -> Result<()> {
        {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match *st {
                ConnectionState::Idle | ConnectionState::Disconnecting => return Ok(()),
                ConnectionState::Failed => {
                    *st = ConnectionState::Idle;
                    return Ok(());
                }
                ConnectionState::Connecting | ConnectionState::Connected => {
                    *st = ConnectionState::Disconnecting;
                }
            }
        }
        debug!(address = %self.device.address, "disconnecting");

        if let Some(link) = self.link.lock().await.take() {
            if let Err(e) = link.close().await {
                warn!(error = %e, "transport close failed");
            }
        }
        // Wake any blocked read; buffered bytes stay drainable.
        self.buffer.close();
        if let Some(handle) = self.pump.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }

        self.set_state(ConnectionState::Idle);
        info!(address = %self.device.address, "disconnected");
        Ok(())
    }

    /// Clear a Failed session back to Idle.
    pub fn acknowledge(&self) {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *st == ConnectionState::Failed {
            *st = ConnectionState::Idle;
        }
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        if let Some(handle) = self.pump.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}
