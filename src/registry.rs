//! Device Model and Registry
//!
//! Immutable device snapshots produced by discovery, keyed by address.
//! A rescan replaces the stored entry; nothing mutates a snapshot in
//! place.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{BtError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Classic,
    Le,
    Dual,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BondState {
    None,
    Bonding,
    Bonded,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
    Public,
    Random,
    Anonymous,
    Unknown,
}

/// Snapshot of a remote device at scan time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub name: String,
    /// Transport-specific unique identifier (MAC-style, the natural key).
    pub address: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    #[serde(rename = "state")]
    pub bond_state: BondState,
    #[serde(rename = "addressType")]
    pub address_type: AddressType,
}

impl Device {
    /// Placeholder snapshot for a device addressed directly without a
    /// prior scan.
    pub fn unknown(address: &str) -> Self {
        Self {
            name: String::new(),
            address: address.to_string(),
            device_type: DeviceType::Unknown,
            bond_state: BondState::Unknown,
            address_type: AddressType::Unknown,
        }
    }
}

/// Validate and normalize a caller-supplied device address.
///
/// Accepts colon-separated pairs of hex digits (`AA:BB:CC:DD:EE:FF`,
/// short test forms like `AA:BB` included). Whitespace is trimmed.
pub fn validate_address(address: &str) -> Result<String> {
    let trimmed = address.trim();
    if trimmed.is_empty() {
        return Err(BtError::InvalidArgument("empty device address".into()));
    }
    let valid = trimmed
        .split(':')
        .all(|part| part.len() == 2 && part.chars().all(|c| c.is_ascii_hexdigit()));
    if !valid {
        return Err(BtError::InvalidArgument(format!(
            "malformed device address: {trimmed}"
        )));
    }
    Ok(trimmed.to_ascii_uppercase())
}

/// Devices seen during discovery, de-duplicated by address.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<String, Device>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a scan result; a later sighting replaces the earlier one.
    /// Addresses are uppercased on the way in so lookups with validated
    /// (normalized) addresses hit regardless of the transport's casing.
    pub fn record_scan_result(&mut self, device: Device) {
        let address = device.address.to_ascii_uppercase();
        self.devices.insert(
            address.clone(),
            Device { address, ..device },
        );
    }

    pub fn get(&self, address: &str) -> Option<Device> {
        self.devices.get(&address.to_ascii_uppercase()).cloned()
    }

    /// Snapshot of all known devices, sorted by address for determinism.
    pub fn list_known(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.devices.values().cloned().collect();
        devices.sort_by(|a, b| a.address.cmp(&b.address));
        devices
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(address: &str, name: &str) -> Device {
        Device {
            name: name.to_string(),
            address: address.to_string(),
            device_type: DeviceType::Classic,
            bond_state: BondState::None,
            address_type: AddressType::Public,
        }
    }

    #[test]
    fn test_upsert_by_address() {
        let mut registry = DeviceRegistry::new();
        registry.record_scan_result(device("AA:BB", "first"));
        registry.record_scan_result(device("AA:BB", "renamed"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("AA:BB").unwrap().name, "renamed");
    }

    #[test]
    fn test_list_known_sorted_by_address() {
        let mut registry = DeviceRegistry::new();
        registry.record_scan_result(device("CC:DD", "b"));
        registry.record_scan_result(device("AA:BB", "a"));
        let known = registry.list_known();
        assert_eq!(known[0].address, "AA:BB");
        assert_eq!(known[1].address, "CC:DD");
    }

    #[test]
    fn test_addresses_normalized_on_insert() {
        let mut registry = DeviceRegistry::new();
        registry.record_scan_result(device("aa:bb", "scale"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.list_known()[0].address, "AA:BB");
        assert!(registry.get("AA:BB").is_some());
        assert!(registry.get("aa:bb").is_some());

        // A re-sighting under different casing is still the same device.
        registry.record_scan_result(device("AA:bb", "renamed"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("aa:BB").unwrap().name, "renamed");
    }

    #[test]
    fn test_validate_address() {
        assert_eq!(validate_address(" aa:bb ").unwrap(), "AA:BB");
        assert_eq!(
            validate_address("00:11:22:33:44:55").unwrap(),
            "00:11:22:33:44:55"
        );
        assert!(matches!(
            validate_address(""),
            Err(BtError::InvalidArgument(_))
        ));
        assert!(matches!(
            validate_address("not-an-address"),
            Err(BtError::InvalidArgument(_))
        ));
        assert!(matches!(
            validate_address("AAA:BB"),
            Err(BtError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_device_json_shape() {
        let json = serde_json::to_value(device("AA:BB", "scale")).unwrap();
        assert_eq!(json["type"], "classic");
        assert_eq!(json["state"], "none");
        assert_eq!(json["addressType"], "public");
    }
}
