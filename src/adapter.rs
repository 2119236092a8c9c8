//! Adapter Power-State Monitor
//!
//! Mirrors the local radio's power state and fans out transitions to
//! subscribers. The monitor is the single writer of the mirrored state;
//! redundant notifications from the OS feed (same state twice) are
//! suppressed so subscribers see one callback per real transition.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{BtError, Result};
use crate::transport::Transport;

/// Power state of the local Bluetooth adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterPowerState {
    On,
    Off,
    TurningOn,
    TurningOff,
}

/// Callback invoked on every real power-state transition.
pub type AdapterListener = Box<dyn Fn(AdapterPowerState) + Send + Sync>;

struct Shared {
    state: Mutex<Option<AdapterPowerState>>,
    listeners: Mutex<Vec<Arc<dyn Fn(AdapterPowerState) + Send + Sync>>>,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, Option<AdapterPowerState>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a state report, notifying listeners only on a real change.
    fn apply(&self, state: AdapterPowerState) {
        {
            let mut current = self.lock_state();
            if *current == Some(state) {
                debug!(?state, "adapter state unchanged, notification suppressed");
                return;
            }
            *current = Some(state);
        }
        info!(?state, "adapter state changed");
        // Dispatch outside the lock so a callback may subscribe.
        let listeners: Vec<_> = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect();
        for listener in listeners {
            listener(state);
        }
    }
}

/// Tracks adapter power state independently of any connection.
pub struct AdapterMonitor {
    transport: Arc<dyn Transport>,
    shared: Arc<Shared>,
    pump: JoinHandle<()>,
}

impl AdapterMonitor {
    /// Seed the mirrored state from the transport and start consuming its
    /// change feed. A transport that cannot report a state yet leaves the
    /// mirror unset; queries then fail with `NotInitialized`.
    pub async fn start(transport: Arc<dyn Transport>) -> Self {
        let initial = transport.adapter_state().await.ok();
        let shared = Arc::new(Shared {
            state: Mutex::new(initial),
            listeners: Mutex::new(Vec::new()),
        });

        let mut events = transport.adapter_events();
        let pump = {
            let shared = shared.clone();
            tokio::spawn(async move {
                while let Some(state) = events.recv().await {
                    shared.apply(state);
                }
                debug!("adapter event feed ended");
            })
        };

        Self {
            transport,
            shared,
            pump,
        }
    }

    /// Current power state, or `NotInitialized` when the transport has
    /// never reported one.
    pub fn current_state(&self) -> Result<AdapterPowerState> {
        self.shared.lock_state().ok_or(BtError::NotInitialized)
    }

    pub fn is_enabled(&self) -> Result<bool> {
        Ok(self.current_state()? == AdapterPowerState::On)
    }

    /// Register a callback for power-state transitions.
    pub fn subscribe(&self, listener: AdapterListener) {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::from(listener));
    }

    /// Ask the transport to enable the adapter and report the resulting
    /// state. On platforms without programmatic enabling this surfaces
    /// the current state without blocking.
    pub async fn request_enable(&self) -> Result<AdapterPowerState> {
        let state = self.transport.request_enable().await?;
        self.shared.apply(state);
        Ok(state)
    }
}

impl Drop for AdapterMonitor {
    fn drop(&mut self) {
        self.pump.abort();
    }
}
