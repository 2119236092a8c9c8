//! Simulated Transport
//!
//! In-memory stand-in for the OS Bluetooth stack. Tests script scan
//! results, adapter transitions, pairing outcomes, and link behavior
//! (inbound injection, send-failure injection, remote drop) through the
//! handle returned by [`MockTransport::new`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::adapter::AdapterPowerState;
use crate::error::{BtError, Result};
use crate::registry::Device;
use crate::transport::{OpenedLink, PermissionStatus, Transport, TransportLink, SPP_UUID};

/// Scripted outcome for a `bond` call.
#[derive(Debug, Clone)]
pub enum BondOutcome {
    Bonded,
    Rejected,
    Failed(String),
}

struct ActiveLink {
    address: String,
    inbound_tx: mpsc::Sender<Vec<u8>>,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    fail_sends: Arc<AtomicUsize>,
}

struct State {
    adapter_state: AdapterPowerState,
    devices: Vec<Device>,
    bond_outcomes: HashMap<String, BondOutcome>,
    refused_connects: Vec<String>,
    hang_connects: bool,
    permissions: PermissionStatus,
    active: Option<ActiveLink>,
}

pub struct MockTransport {
    state: Mutex<State>,
    adapter_tx: mpsc::UnboundedSender<AdapterPowerState>,
    adapter_rx: Mutex<Option<mpsc::UnboundedReceiver<AdapterPowerState>>>,
    links_closed: Arc<AtomicUsize>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        let (adapter_tx, adapter_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            state: Mutex::new(State {
                adapter_state: AdapterPowerState::On,
                devices: Vec::new(),
                bond_outcomes: HashMap::new(),
                refused_connects: Vec::new(),
                hang_connects: false,
                permissions: PermissionStatus::Granted,
                active: None,
            }),
            adapter_tx,
            adapter_rx: Mutex::new(Some(adapter_rx)),
            links_closed: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // --- scripting handles -------------------------------------------------

    /// Device reported by the next discovery window.
    pub fn add_device(&self, device: Device) {
        self.lock().devices.push(device);
    }

    /// Overwrite the current adapter state without emitting an event.
    pub fn set_adapter_state(&self, state: AdapterPowerState) {
        self.lock().adapter_state = state;
    }

    /// Emit an adapter state report on the event feed.
    pub fn push_adapter_event(&self, state: AdapterPowerState) {
        self.lock().adapter_state = state;
        let _ = self.adapter_tx.send(state);
    }

    pub fn set_bond_outcome(&self, address: &str, outcome: BondOutcome) {
        self.lock().bond_outcomes.insert(address.to_string(), outcome);
    }

    /// Make `open` fail for the given address.
    pub fn refuse_connect(&self, address: &str) {
        self.lock().refused_connects.push(address.to_string());
    }

    /// Make `open` stall past any reasonable connect timeout.
    pub fn hang_connects(&self, hang: bool) {
        self.lock().hang_connects = hang;
    }

    pub fn set_permissions(&self, status: PermissionStatus) {
        self.lock().permissions = status;
    }

    /// Deliver bytes on the active link, as if the remote device sent
    /// them. Returns false when no link is open.
    pub async fn inject_inbound(&self, bytes: &[u8]) -> bool {
        let tx = match self.lock().active.as_ref() {
            Some(link) => link.inbound_tx.clone(),
            None => return false,
        };
        tx.send(bytes.to_vec()).await.is_ok()
    }

    /// Payloads written to the active link so far, in issue order.
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        match self.lock().active.as_ref() {
            Some(link) => link.sent.lock().unwrap_or_else(|e| e.into_inner()).clone(),
            None => Vec::new(),
        }
    }

    /// Fail the next `count` sends with a transient transport error.
    pub fn fail_next_sends(&self, count: usize) {
        if let Some(link) = self.lock().active.as_ref() {
            link.fail_sends.store(count, Ordering::SeqCst);
        }
    }

    /// Simulate the remote side dropping the link: the inbound stream
    /// ends and the session observes a transport-triggered disconnect.
    pub fn drop_link(&self) {
        if let Some(link) = self.lock().active.take() {
            debug!(address = %link.address, "mock link dropped by remote");
        }
    }

    pub fn active_address(&self) -> Option<String> {
        self.lock().active.as_ref().map(|l| l.address.clone())
    }

    /// How many links have had `close` called on them.
    pub fn closed_link_count(&self) -> usize {
        self.links_closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn discover(&self, duration: Duration) -> Result<mpsc::Receiver<Device>> {
        let devices = {
            let state = self.lock();
            if state.adapter_state != AdapterPowerState::On {
                return Err(BtError::transport("bluetooth is not enabled"));
            }
            state.devices.clone()
        };
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for device in devices {
                if tx.send(device).await.is_err() {
                    return;
                }
            }
            // Keep the window open so the caller observes its close.
            tokio::time::sleep(duration).await;
        });
        Ok(rx)
    }

    async fn bond(&self, address: &str) -> Result<()> {
        let outcome = self
            .lock()
            .bond_outcomes
            .get(address)
            .cloned()
            .unwrap_or(BondOutcome::Bonded);
        match outcome {
            BondOutcome::Bonded => Ok(()),
            BondOutcome::Rejected => Err(BtError::PairingRejected),
            BondOutcome::Failed(reason) => Err(BtError::PairingFailed(reason)),
        }
    }

    async fn open(&self, address: &str) -> Result<OpenedLink> {
        let hang = {
            let state = self.lock();
            if state.refused_connects.iter().any(|a| a == address) {
                return Err(BtError::transport(format!("connection refused: {address}")));
            }
            state.hang_connects
        };
        if hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            return Err(BtError::transport("connect stalled"));
        }
        debug!(%address, service = SPP_UUID, "opening rfcomm link");

        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let sent = Arc::new(Mutex::new(Vec::new()));
        let fail_sends = Arc::new(AtomicUsize::new(0));
        self.lock().active = Some(ActiveLink {
            address: address.to_string(),
            inbound_tx,
            sent: sent.clone(),
            fail_sends: fail_sends.clone(),
        });
        Ok(OpenedLink {
            link: Box::new(MockLink {
                sent,
                fail_sends,
                closed: AtomicBool::new(false),
                closed_counter: self.links_closed.clone(),
            }),
            inbound: inbound_rx,
        })
    }

    async fn adapter_state(&self) -> Result<AdapterPowerState> {
        Ok(self.lock().adapter_state)
    }

    fn adapter_events(&self) -> mpsc::UnboundedReceiver<AdapterPowerState> {
        let taken = self
            .adapter_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match taken {
            Some(rx) => rx,
            None => {
                // Single consumer; hand out a dead channel afterwards.
                let (_, rx) = mpsc::unbounded_channel();
                rx
            }
        }
    }

    async fn request_enable(&self) -> Result<AdapterPowerState> {
        self.push_adapter_event(AdapterPowerState::On);
        Ok(AdapterPowerState::On)
    }

    async fn check_permissions(&self) -> Result<PermissionStatus> {
        Ok(self.lock().permissions)
    }

    async fn request_permissions(&self) -> Result<PermissionStatus> {
        let mut state = self.lock();
        if state.permissions == PermissionStatus::Prompt {
            state.permissions = PermissionStatus::Granted;
        }
        Ok(state.permissions)
    }
}

struct MockLink {
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    fail_sends: Arc<AtomicUsize>,
    closed: AtomicBool,
    closed_counter: Arc<AtomicUsize>,
}

#[async_trait]
impl TransportLink for MockLink {
    async fn send(&self, data: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BtError::transport("link closed"));
        }
        let remaining = self.fail_sends.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_sends.store(remaining - 1, Ordering::SeqCst);
            return Err(BtError::transport("injected send failure"));
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(data.to_vec());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.closed_counter.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
