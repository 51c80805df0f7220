//! In-memory device registry with a durable JSON mirror.
//!
//! All mutation happens on the gateway task; there are no background
//! threads here. Durable fields (keys, pairing completion, capabilities,
//! description) are flushed synchronously by the callers that change them.

use crate::device::{Device, DiscoveryAnswer, DurableDevice, PairingState};
use crate::error::GatewayError;
use crate::packet::Address;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

pub struct DeviceRegistry {
    devices: BTreeMap<Address, Device>,
    path: PathBuf,
}

impl DeviceRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DeviceRegistry {
            devices: BTreeMap::new(),
            path: path.into(),
        }
    }

    /// Load the durable mirror, replacing in-memory content. Missing file
    /// means an empty registry, not an error.
    pub fn load_durable(&mut self) -> Result<usize, GatewayError> {
        if !Path::new(&self.path).exists() {
            debug!(path = %self.path.display(), "no device database, starting fresh");
            self.devices.clear();
            return Ok(0);
        }
        let raw = fs::read_to_string(&self.path)?;
        let stored: BTreeMap<String, DurableDevice> = serde_json::from_str(&raw)?;
        self.devices.clear();
        for (key, durable) in stored {
            match key.parse::<Address>() {
                Ok(addr) => {
                    self.devices.insert(addr, durable.into_device(addr));
                }
                Err(_) => warn!(key = %key, "skipping device with invalid address key"),
            }
        }
        info!(count = self.devices.len(), path = %self.path.display(), "loaded device registry");
        Ok(self.devices.len())
    }

    /// Rewrite the durable mirror atomically: serialize to a sibling temp
    /// file, then rename over the target.
    pub fn save_durable(&self) -> Result<(), GatewayError> {
        let stored: BTreeMap<String, DurableDevice> = self
            .devices
            .iter()
            .map(|(addr, dev)| (addr.to_string(), DurableDevice::from(dev)))
            .collect();
        let json = serde_json::to_string_pretty(&stored)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        debug!(count = self.devices.len(), path = %self.path.display(), "saved device registry");
        Ok(())
    }

    /// Save, demoting I/O failures to a log line: in-memory state stays
    /// authoritative and the next successful save reconciles.
    pub fn save_best_effort(&self) {
        if let Err(err) = self.save_durable() {
            warn!(%err, "device registry save failed, keeping in-memory state");
        }
    }

    pub fn get(&self, addr: Address) -> Option<&Device> {
        self.devices.get(&addr)
    }

    pub fn get_mut(&mut self, addr: Address) -> Option<&mut Device> {
        self.devices.get_mut(&addr)
    }

    pub fn get_or_create(&mut self, addr: Address) -> &mut Device {
        self.devices.entry(addr).or_insert_with(|| {
            debug!(%addr, "registering new device");
            Device::new(addr)
        })
    }

    pub fn remove(&mut self, addr: Address) -> Option<Device> {
        let removed = self.devices.remove(&addr);
        if removed.is_some() {
            info!(%addr, "removed device");
        }
        removed
    }

    pub fn all(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn by_state(&self, state: PairingState) -> impl Iterator<Item = &Device> {
        self.devices.values().filter(move |d| d.pairing_state == state)
    }

    /// The serial-pairing invariant makes this at most one device.
    pub fn any_in_pairing(&self) -> Option<&Device> {
        self.devices.values().find(|d| d.pairing_state.is_in_progress())
    }

    /// Discovery answers may introduce a device we have never seen.
    pub fn update_from_discovery(
        &mut self,
        addr: Address,
        answer: &DiscoveryAnswer,
        now: Instant,
    ) {
        let device = self.get_or_create(addr);
        device.capabilities.apply_discovery(answer);
        device.touch(now);
        debug!(%addr, node_type = answer.node_type, node_subtype = answer.node_subtype,
               "capabilities from discovery answer");
    }

    pub fn update_name(&mut self, addr: Address, name: &str, now: Instant) -> bool {
        match self.devices.get_mut(&addr) {
            Some(device) => {
                device.capabilities.name = name.to_string();
                device.touch(now);
                true
            }
            None => false,
        }
    }

    pub fn update_general_info1(&mut self, addr: Address, data: &[u8], now: Instant) -> bool {
        if data.len() < 14 {
            return false;
        }
        match self.devices.get_mut(&addr) {
            Some(device) => {
                let mut info = [0u8; 14];
                info.copy_from_slice(&data[..14]);
                device.capabilities.general_info1 = Some(info);
                device.touch(now);
                true
            }
            None => false,
        }
    }

    pub fn update_general_info2(&mut self, addr: Address, data: &[u8], now: Instant) -> bool {
        if data.len() < 16 {
            return false;
        }
        match self.devices.get_mut(&addr) {
            Some(device) => {
                let mut info = [0u8; 16];
                info.copy_from_slice(&data[..16]);
                device.capabilities.general_info2 = Some(info);
                device.touch(now);
                true
            }
            None => false,
        }
    }

    pub fn store_challenge(&mut self, addr: Address, data: &[u8], now: Instant) -> bool {
        if data.len() < 6 {
            return false;
        }
        match self.devices.get_mut(&addr) {
            Some(device) => {
                let mut challenge = [0u8; 6];
                challenge.copy_from_slice(&data[..6]);
                device.store_challenge(challenge);
                device.touch(now);
                true
            }
            None => false,
        }
    }

    /// Record the MAC we answered with; the challenge is no longer pending.
    pub fn store_response(&mut self, addr: Address, data: &[u8], now: Instant) -> bool {
        if data.len() < 6 {
            return false;
        }
        match self.devices.get_mut(&addr) {
            Some(device) => {
                let mut response = [0u8; 6];
                response.copy_from_slice(&data[..6]);
                device.last_response = Some(response);
                device.clear_pending_challenge();
                device.touch(now);
                true
            }
            None => false,
        }
    }

    fn store_key(
        &mut self,
        addr: Address,
        data: &[u8],
        now: Instant,
        slot: fn(&mut Device) -> &mut Option<[u8; 16]>,
    ) -> bool {
        if data.len() < 16 {
            return false;
        }
        match self.devices.get_mut(&addr) {
            Some(device) => {
                let mut key = [0u8; 16];
                key.copy_from_slice(&data[..16]);
                *slot(device) = Some(key);
                device.touch(now);
                true
            }
            None => false,
        }
    }

    /// Installing the system key is a durable event.
    pub fn store_system_key(&mut self, addr: Address, key: &[u8], now: Instant) -> bool {
        let stored = self.store_key(addr, key, now, |d| &mut d.system_key);
        if stored {
            info!(%addr, "system key installed");
            self.save_best_effort();
        }
        stored
    }

    pub fn store_stack_key(&mut self, addr: Address, key: &[u8], now: Instant) -> bool {
        self.store_key(addr, key, now, |d| &mut d.stack_key)
    }

    pub fn store_session_key(&mut self, addr: Address, key: &[u8], now: Instant) -> bool {
        self.store_key(addr, key, now, |d| &mut d.session_key)
    }

    pub fn set_description(&mut self, addr: Address, description: &str) -> bool {
        match self.devices.get_mut(&addr) {
            Some(device) => {
                device.description = description.to_string();
                self.save_best_effort();
                true
            }
            None => false,
        }
    }

    pub fn begin_pairing(&mut self, addr: Address, now: Instant) -> Result<(), GatewayError> {
        if let Some(active) = self.any_in_pairing() {
            return Err(GatewayError::PairingBusy(active.address()));
        }
        self.get_or_create(addr).begin_pairing(now);
        info!(%addr, "pairing session opened");
        Ok(())
    }

    /// Completion is a durable event.
    pub fn complete_pairing(&mut self, addr: Address, now: Instant) -> bool {
        match self.devices.get_mut(&addr) {
            Some(device) => {
                device.pairing_state = PairingState::Paired;
                device.touch(now);
                info!(%addr, "pairing complete");
                self.save_best_effort();
                true
            }
            None => false,
        }
    }

    pub fn fail_pairing(&mut self, addr: Address, now: Instant) -> bool {
        match self.devices.get_mut(&addr) {
            Some(device) => {
                device.pairing_state = PairingState::Failed;
                device.touch(now);
                warn!(%addr, "pairing failed");
                true
            }
            None => false,
        }
    }

    /// Sweep sessions past the umbrella timeout into `Failed`.
    pub fn sweep_timed_out(&mut self, now: Instant) -> Vec<Address> {
        let expired: Vec<Address> = self
            .devices
            .values()
            .filter(|d| d.pairing_timed_out(now))
            .map(|d| d.address())
            .collect();
        for addr in &expired {
            self.fail_pairing(*addr, now);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> Address {
        Address::new([n, n, n])
    }

    #[test]
    fn serial_pairing_enforced() {
        let mut reg = DeviceRegistry::new("/nonexistent/never-written.json");
        let now = Instant::now();
        reg.begin_pairing(addr(1), now).unwrap();
        assert!(matches!(
            reg.begin_pairing(addr(2), now),
            Err(GatewayError::PairingBusy(_))
        ));
        reg.fail_pairing(addr(1), now);
        reg.begin_pairing(addr(2), now).unwrap();
        assert_eq!(reg.any_in_pairing().unwrap().address(), addr(2));
    }

    #[test]
    fn unknown_address_updates_refused() {
        let mut reg = DeviceRegistry::new("/nonexistent/never-written.json");
        let now = Instant::now();
        assert!(!reg.update_name(addr(9), "ghost", now));
        assert!(!reg.update_general_info1(addr(9), &[0u8; 14], now));
        assert!(!reg.store_challenge(addr(9), &[0u8; 6], now));
    }

    #[test]
    fn short_inputs_refused() {
        let mut reg = DeviceRegistry::new("/nonexistent/never-written.json");
        let now = Instant::now();
        reg.get_or_create(addr(1));
        assert!(!reg.update_general_info1(addr(1), &[0u8; 13], now));
        assert!(!reg.update_general_info2(addr(1), &[0u8; 15], now));
        assert!(!reg.store_challenge(addr(1), &[0u8; 5], now));
        assert!(reg.get(addr(1)).unwrap().capabilities.general_info1.is_none());
    }

    #[test]
    fn inputs_clamped_to_expected_length() {
        let mut reg = DeviceRegistry::new("/nonexistent/never-written.json");
        let now = Instant::now();
        reg.get_or_create(addr(1));
        assert!(reg.update_general_info1(addr(1), &[0xaa; 20], now));
        assert_eq!(
            reg.get(addr(1)).unwrap().capabilities.general_info1,
            Some([0xaa; 14])
        );
    }
}
