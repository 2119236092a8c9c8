//! Session Manager
//!
//! Top-level façade coordinating scan → pair → connect → read/write →
//! disconnect over a single [`Transport`]. At most one session may be
//! Connecting/Connected/Disconnecting at a time (Classic serial links on
//! mobile adapters allow one active connection), and adapter power state
//! is monitored independently of any session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::adapter::{AdapterListener, AdapterMonitor, AdapterPowerState};
use crate::config::Config;
use crate::error::{BtError, Result};
use crate::registry::{validate_address, Device, DeviceRegistry};
use crate::session::{ConnectionSession, ConnectionState};
use crate::transport::{PermissionStatus, Transport};

struct ScanGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

pub struct SessionManager {
    transport: Arc<dyn Transport>,
    config: Config,
    registry: Mutex<DeviceRegistry>,
    session: AsyncMutex<Option<Arc<ConnectionSession>>>,
    scanning: AtomicBool,
    adapter: AdapterMonitor,
}

impl SessionManager {
    pub async fn new(transport: Arc<dyn Transport>, config: Config) -> Self {
        let adapter = AdapterMonitor::start(transport.clone()).await;
        Self {
            transport,
            config,
            registry: Mutex::new(DeviceRegistry::new()),
            session: AsyncMutex::new(None),
            scanning: AtomicBool::new(false),
            adapter,
        }
    }

    fn lock_registry(&self) -> MutexGuard<'_, DeviceRegistry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a discovery window and return the devices seen when it
    /// closes. Results arriving after the close are discarded. A second
    /// scan while one is open fails with `ScanInProgress`.
    pub async fn scan(&self, duration: Option<Duration>) -> Result<Vec<Device>> {
        let duration = duration.unwrap_or_else(|| self.config.scan_duration());
        if self.scanning.swap(true, Ordering::SeqCst) {
            return Err(BtError::ScanInProgress);
        }
        // The guard releases the flag on every exit path, including the
        // caller dropping this future mid-scan.
        let _guard = ScanGuard {
            flag: &self.scanning,
        };
        self.run_scan(duration).await
    }

    async fn run_scan(&self, duration: Duration) -> Result<Vec<Device>> {
        info!(?duration, "starting discovery");
        let mut results = self.transport.discover(duration).await?;
        self.lock_registry().clear();

        let deadline = Instant::now() + duration;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, results.recv()).await {
                Ok(Some(device)) => {
                    debug!(address = %device.address, "device discovered");
                    self.lock_registry().record_scan_result(device);
                }
                // Transport closed the stream early or the window elapsed.
                Ok(None) | Err(_) => break,
            }
        }
        // Dropping the receiver discards anything that arrives late.
        drop(results);

        let devices = self.lock_registry().list_known();
        info!(count = devices.len(), "discovery window closed");
        Ok(devices)
    }

    /// Devices known from the last scan.
    pub fn known_devices(&self) -> Vec<Device> {
        self.lock_registry().list_known()
    }

    /// OS-level bonding with the addressed device.
    pub async fn pair(&self, address: &str) -> Result<()> {
        let address = validate_address(address)?;
        info!(%address, "pairing");
        self.transport.bond(&address).await
    }

    /// Connect to the addressed device with the configured timeout.
    pub async fn connect(&self, address: &str) -> Result<()> {
        self.connect_with_timeout(address, self.config.connect_timeout())
            .await
    }

    /// Connect, rejecting with `AlreadyConnected` while another session
    /// is Connecting, Connected, or Disconnecting. A Failed leftover is
    /// acknowledged and replaced; the device need not have been scanned.
    pub async fn connect_with_timeout(&self, address: &str, timeout: Duration) -> Result<()> {
        let address = validate_address(address)?;
        let session = {
            let mut slot = self.session.lock().await;
            if let Some(existing) = slot.as_ref() {
                match existing.state() {
                    ConnectionState::Connecting
                    | ConnectionState::Connected
                    | ConnectionState::Disconnecting => return Err(BtError::AlreadyConnected),
                    ConnectionState::Failed => existing.acknowledge(),
                    ConnectionState::Idle => {}
                }
            }
            let device = self
                .lock_registry()
                .get(&address)
                .unwrap_or_else(|| Device::unknown(&address));
            let session = Arc::new(ConnectionSession::new(device, self.config.buffer_capacity));
            // Publish before awaiting the transport so a concurrent
            // connect sees Connecting instead of queuing.
            *slot = Some(session.clone());
            session
        };
        session.establish(&self.transport, timeout).await
    }

    async fn active_session(&self) -> Result<Arc<ConnectionSession>> {
        self.session
            .lock()
            .await
            .as_ref()
            .cloned()
            .ok_or(BtError::NotConnected)
    }

    /// Send one payload on the active session.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        self.active_session().await?.write(data).await
    }

    /// Without a timeout: drain whatever is buffered right now. With a
    /// timeout: wait for at least one byte first.
    pub async fn read(&self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let session = self.active_session().await?;
        match timeout {
            None => session.read_all(),
            Some(timeout) => session.read_some(timeout).await,
        }
    }

    /// Read up to and including `delimiter`; the configured read timeout
    /// applies when none is given.
    pub async fn read_until(&self, delimiter: &[u8], timeout: Option<Duration>) -> Result<Vec<u8>> {
        let timeout = timeout.unwrap_or_else(|| self.config.read_timeout());
        self.active_session()
            .await?
            .read_until(delimiter, timeout)
            .await
    }

    /// Tear down the active session. Idempotent; with no session at all
    /// this is a no-op success. The session stays drainable afterwards.
    pub async fn disconnect(&self) -> Result<()> {
        match self.session.lock().await.as_ref() {
            Some(session) => session.disconnect().await,
            None => Ok(()),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        // try_lock: state queries must not park behind a connect in
        // flight; the slot is only held briefly otherwise.
        match self.session.try_lock() {
            Ok(slot) => slot
                .as_ref()
                .map(|s| s.state())
                .unwrap_or(ConnectionState::Idle),
            Err(_) => ConnectionState::Connecting,
        }
    }

    // --- adapter & permissions --------------------------------------------

    pub fn adapter_state(&self) -> Result<AdapterPowerState> {
        self.adapter.current_state()
    }

    pub fn is_enabled(&self) -> Result<bool> {
        self.adapter.is_enabled()
    }

    /// Ask the OS to power the adapter on; reports whether it ended up
    /// on. Merely re-reads the state on platforms that disallow
    /// programmatic enable.
    pub async fn enable(&self) -> Result<bool> {
        if self.adapter.is_enabled().unwrap_or(false) {
            return Ok(true);
        }
        Ok(self.adapter.request_enable().await? == AdapterPowerState::On)
    }

    pub fn subscribe_adapter_state(&self, listener: AdapterListener) {
        self.adapter.subscribe(listener);
    }

    pub async fn check_permissions(&self) -> Result<PermissionStatus> {
        self.transport.check_permissions().await
    }

    pub async fn request_permissions(&self) -> Result<PermissionStatus> {
        self.transport.request_permissions().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{AddressType, BondState, DeviceType};
    use crate::transport::mock::{BondOutcome, MockTransport};
    use crate::transport::unsupported::UnsupportedTransport;

    fn device(address: &str, name: &str) -> Device {
        Device {
            name: name.to_string(),
            address: address.to_string(),
            device_type: DeviceType::Classic,
            bond_state: BondState::None,
            address_type: AddressType::Public,
        }
    }

    async fn manager(transport: Arc<MockTransport>) -> SessionManager {
        SessionManager::new(transport, Config::default()).await
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_scan_populates_registry() {
        let transport = MockTransport::new();
        transport.add_device(device("CC:DD", "printer"));
        transport.add_device(device("AA:BB", "scale"));
        let manager = manager(transport).await;

        let devices = manager
            .scan(Some(Duration::from_millis(50)))
            .await
            .unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].address, "AA:BB");
        assert_eq!(devices[1].address, "CC:DD");
        assert_eq!(manager.known_devices().len(), 2);
    }

    #[tokio::test]
    async fn test_overlapping_scan_rejected() {
        let transport = MockTransport::new();
        let manager = Arc::new(manager(transport).await);

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.scan(Some(Duration::from_millis(200))).await })
        };
        settle().await;
        let err = manager.scan(Some(Duration::from_millis(50))).await.unwrap_err();
        assert!(matches!(err, BtError::ScanInProgress));
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_scan_releases_discovery() {
        let transport = MockTransport::new();
        let manager = Arc::new(manager(transport).await);

        let aborted = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.scan(Some(Duration::from_secs(5))).await })
        };
        settle().await;
        aborted.abort();
        let _ = aborted.await;

        // The dropped scan must not leave the in-progress flag set.
        manager
            .scan(Some(Duration::from_millis(50)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_scan_fails_when_adapter_off() {
        let transport = MockTransport::new();
        transport.set_adapter_state(AdapterPowerState::Off);
        let manager = manager(transport).await;
        let err = manager.scan(Some(Duration::from_millis(50))).await.unwrap_err();
        assert!(matches!(err, BtError::Transport(_)));
    }

    #[tokio::test]
    async fn test_second_connect_rejected() {
        let transport = MockTransport::new();
        let manager = manager(transport).await;

        manager.connect("AA:BB").await.unwrap();
        let err = manager.connect("CC:DD").await.unwrap_err();
        assert!(matches!(err, BtError::AlreadyConnected));
        assert_eq!(manager.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let transport = MockTransport::new();
        let manager = manager(transport).await;

        // No session at all is a no-op success.
        manager.disconnect().await.unwrap();

        manager.connect("AA:BB").await.unwrap();
        manager.disconnect().await.unwrap();
        manager.disconnect().await.unwrap();
        assert_eq!(manager.connection_state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_reconnect_after_disconnect() {
        let transport = MockTransport::new();
        let manager = manager(transport.clone()).await;

        manager.connect("AA:BB").await.unwrap();
        manager.disconnect().await.unwrap();
        manager.connect("CC:DD").await.unwrap();
        assert_eq!(transport.active_address().unwrap(), "CC:DD");
    }

    #[tokio::test]
    async fn test_write_requires_connection() {
        let transport = MockTransport::new();
        let manager = manager(transport).await;
        let err = manager.write(b"ping").await.unwrap_err();
        assert!(matches!(err, BtError::NotConnected));
    }

    #[tokio::test]
    async fn test_write_preserves_order_and_rejects_empty() {
        let transport = MockTransport::new();
        let manager = manager(transport.clone()).await;
        manager.connect("AA:BB").await.unwrap();

        manager.write(b"hello").await.unwrap();
        manager.write(b"world").await.unwrap();
        assert_eq!(transport.sent_frames(), vec![b"hello".to_vec(), b"world".to_vec()]);

        let err = manager.write(b"").await.unwrap_err();
        assert!(matches!(err, BtError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_write_retries_one_transient_failure() {
        let transport = MockTransport::new();
        let manager = manager(transport.clone()).await;
        manager.connect("AA:BB").await.unwrap();

        transport.fail_next_sends(1);
        manager.write(b"retried").await.unwrap();
        assert_eq!(transport.sent_frames(), vec![b"retried".to_vec()]);

        transport.fail_next_sends(2);
        let err = manager.write(b"doomed").await.unwrap_err();
        assert!(matches!(err, BtError::Transport(_)));
    }

    #[tokio::test]
    async fn test_read_until_across_chunks() {
        let transport = MockTransport::new();
        let manager = manager(transport.clone()).await;
        manager.connect("AA:BB").await.unwrap();

        assert!(transport.inject_inbound(&[0x41, 0x42]).await);
        assert!(transport.inject_inbound(&[0x43, 0x0D]).await);
        let out = manager
            .read_until(&[0x0D], Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(out, vec![0x41, 0x42, 0x43, 0x0D]);
    }

    #[tokio::test]
    async fn test_read_until_timeout_keeps_data() {
        let transport = MockTransport::new();
        let manager = manager(transport.clone()).await;
        manager.connect("AA:BB").await.unwrap();

        transport.inject_inbound(b"partial").await;
        settle().await;
        let err = manager
            .read_until(b"\n", Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, BtError::ReadTimeout(_)));
        assert_eq!(manager.read(None).await.unwrap(), b"partial");
    }

    #[tokio::test]
    async fn test_remote_drop_wakes_pending_read() {
        let transport = MockTransport::new();
        let manager = Arc::new(manager(transport.clone()).await);
        manager.connect("AA:BB").await.unwrap();

        let reader = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager.read_until(b"\n", Some(Duration::from_secs(5))).await
            })
        };
        settle().await;
        transport.drop_link();
        let err = reader.await.unwrap().unwrap_err();
        assert!(matches!(err, BtError::ConnectionClosed));

        // Session reset: a new connect is allowed.
        settle().await;
        manager.connect("AA:BB").await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_drop_releases_transport_handle() {
        let transport = MockTransport::new();
        let manager = manager(transport.clone()).await;
        manager.connect("AA:BB").await.unwrap();
        assert_eq!(transport.closed_link_count(), 0);

        transport.drop_link();
        settle().await;

        // The session's half of the link is closed, not just orphaned.
        assert_eq!(transport.closed_link_count(), 1);
        assert_eq!(manager.connection_state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_drain_after_disconnect() {
        let transport = MockTransport::new();
        let manager = manager(transport.clone()).await;
        manager.connect("AA:BB").await.unwrap();

        transport.inject_inbound(b"tail").await;
        settle().await;
        manager.disconnect().await.unwrap();
        assert_eq!(manager.read(None).await.unwrap(), b"tail");
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_then_recovery() {
        let transport = MockTransport::new();
        let manager = manager(transport.clone()).await;

        transport.hang_connects(true);
        let err = manager
            .connect_with_timeout("AA:BB", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, BtError::ConnectTimeout(_)));
        assert_eq!(manager.connection_state(), ConnectionState::Failed);

        // A failed session does not hold the single-connection slot.
        transport.hang_connects(false);
        manager.connect("AA:BB").await.unwrap();
        assert_eq!(manager.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_connect_refused_surfaces_transport_error() {
        let transport = MockTransport::new();
        transport.refuse_connect("AA:BB");
        let manager = manager(transport).await;
        let err = manager.connect("AA:BB").await.unwrap_err();
        assert!(matches!(err, BtError::Transport(_)));
    }

    #[tokio::test]
    async fn test_pairing_outcomes() {
        let transport = MockTransport::new();
        transport.set_bond_outcome("AA:BB", BondOutcome::Rejected);
        transport.set_bond_outcome("CC:DD", BondOutcome::Failed("remote busy".into()));
        let manager = manager(transport).await;

        assert!(matches!(
            manager.pair("AA:BB").await.unwrap_err(),
            BtError::PairingRejected
        ));
        assert!(matches!(
            manager.pair("CC:DD").await.unwrap_err(),
            BtError::PairingFailed(_)
        ));
        manager.pair("EE:FF").await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_addresses_rejected() {
        let transport = MockTransport::new();
        let manager = manager(transport).await;
        assert!(matches!(
            manager.connect("").await.unwrap_err(),
            BtError::InvalidArgument(_)
        ));
        assert!(matches!(
            manager.pair("not-an-address").await.unwrap_err(),
            BtError::InvalidArgument(_)
        ));
    }

    #[tokio::test]
    async fn test_enable_and_permissions() {
        let transport = MockTransport::new();
        transport.set_adapter_state(AdapterPowerState::Off);
        let manager = manager(transport.clone()).await;

        assert!(!manager.is_enabled().unwrap());
        assert!(manager.enable().await.unwrap());
        assert!(manager.is_enabled().unwrap());

        assert_eq!(
            manager.check_permissions().await.unwrap(),
            PermissionStatus::Granted
        );
        transport.set_permissions(PermissionStatus::Prompt);
        assert_eq!(
            manager.check_permissions().await.unwrap(),
            PermissionStatus::Prompt
        );
        assert_eq!(
            manager.request_permissions().await.unwrap(),
            PermissionStatus::Granted
        );
    }

    #[tokio::test]
    async fn test_unsupported_transport_rejects_everything() {
        let transport: Arc<dyn Transport> = Arc::new(UnsupportedTransport::new());
        let manager = SessionManager::new(transport, Config::default()).await;

        assert!(matches!(
            manager.scan(None).await.unwrap_err(),
            BtError::Transport(_)
        ));
        assert!(matches!(
            manager.connect("AA:BB").await.unwrap_err(),
            BtError::Transport(_)
        ));
        assert!(matches!(
            manager.adapter_state().unwrap_err(),
            BtError::NotInitialized
        ));
        assert_eq!(
            manager.check_permissions().await.unwrap(),
            PermissionStatus::Denied
        );
    }
}
