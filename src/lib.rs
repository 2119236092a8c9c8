//! Bluetooth Classic Serial-Link Session Manager
//!
//! Connection lifecycle, inbound buffering, delimiter-bounded reads, and
//! adapter power-state monitoring for RFCOMM/SPP serial links. The OS
//! Bluetooth stack sits behind the [`transport::Transport`] trait;
//! everything above it is platform-free.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     SessionManager                      │
//! │   (public async API: scan / pair / connect / io)        │
//! └──────────┬──────────────────┬───────────────┬───────────┘
//!            │                  │               │
//!            ▼                  ▼               ▼
//! ┌─────────────────┐  ┌────────────────┐  ┌──────────────┐
//! │ DeviceRegistry  │  │ConnectionSession│ │AdapterMonitor│
//! │                 │  │                │  │              │
//! │ - scan results  │  │ - state machine│  │ - power state│
//! │ - dedup by addr │  │ - write mutex  │  │ - subscribers│
//! └─────────────────┘  └───────┬────────┘  └──────────────┘
//!                              │
//!                              ▼
//!                     ┌────────────────┐
//!                     │ByteStreamBuffer│
//!                     │ - readUntil    │
//!                     │ - capped queue │
//!                     └────────────────┘
//! ```
//!
//! All of it sits on top of a [`transport::Transport`] implementation:
//! a real OS binding, the in-memory [`transport::mock::MockTransport`],
//! or [`transport::unsupported::UnsupportedTransport`] on platforms
//! without a Classic Bluetooth API.

pub mod adapter;
pub mod buffer;
pub mod config;
pub mod error;
pub mod logging;
pub mod manager;
pub mod registry;
pub mod session;
pub mod transport;

pub use adapter::{AdapterMonitor, AdapterPowerState};
pub use buffer::ByteStreamBuffer;
pub use config::Config;
pub use error::{BtError, Result};
pub use manager::SessionManager;
pub use registry::{Device, DeviceRegistry};
pub use session::{ConnectionSession, ConnectionState};
pub use transport::{PermissionStatus, Transport};
