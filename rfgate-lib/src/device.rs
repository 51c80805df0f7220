//! Device model: pairing lifecycle, capabilities, and the durable mirror.

use crate::constants::PAIRING_TIMEOUT;
use crate::packet::{Address, Command};
use modular_bitfield::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Pairing lifecycle of a single device. Exactly one device may sit in a
/// non-terminal state at any time; the registry enforces that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PairingState {
    Unpaired,
    Discovering,
    AliveCheck,
    Broadcasting2A,
    AwaitingPriorityAddr,
    ChallengeSent,
    ChallengeReceived,
    PairingConfirmed,
    AskingChallenge,
    KeyExchanged,
    Paired,
    Failed,
}

impl PairingState {
    /// Terminal states survive restarts; everything else is a live session.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PairingState::Unpaired | PairingState::Paired | PairingState::Failed
        )
    }

    pub fn is_in_progress(self) -> bool {
        !self.is_terminal()
    }
}

/// Multi-info byte from the discovery answer.
#[bitfield(bytes = 1)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MultiInfo {
    /// Actuator turnaround time class.
    pub turnaround_time: B2,
    pub sync_control_group: bool,
    /// Inverted on air: 0 means the node supports RF configuration.
    pub rf_unsupported: bool,
    /// Inverted on air: 0 means the node belongs to an IO installation.
    pub io_nonmember: bool,
    pub power_save_mode: B2,
    #[skip]
    reserved: B1,
}

/// Parsed 9-byte capability tuple from a `0x29` discovery answer:
/// packed type/subtype, a 3-byte backbone echo, manufacturer, multi-info,
/// and a 16-bit device timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryAnswer {
    pub node_type: u16,
    pub node_subtype: u8,
    pub manufacturer: u8,
    pub multi_info: u8,
    pub timestamp: u16,
}

impl DiscoveryAnswer {
    /// Caller guarantees at least 9 bytes; the codec layer enforces it.
    pub fn parse(data: &[u8]) -> Self {
        let packed = u16::from_be_bytes([data[0], data[1]]);
        DiscoveryAnswer {
            node_type: (packed >> 6) & 0x3ff,
            node_subtype: (packed & 0x3f) as u8,
            manufacturer: data[5],
            multi_info: data[6],
            timestamp: u16::from_be_bytes([data[7], data[8]]),
        }
    }
}

/// Identity harvested during pairing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub node_type: u16,
    pub node_subtype: u8,
    pub manufacturer: u8,
    pub multi_info: u8,
    pub timestamp: u16,
    #[serde(default)]
    pub name: String,
    #[serde(default, with = "hex_opt", skip_serializing_if = "Option::is_none")]
    pub general_info1: Option<[u8; 14]>,
    #[serde(default, with = "hex_opt", skip_serializing_if = "Option::is_none")]
    pub general_info2: Option<[u8; 16]>,
}

impl Capabilities {
    pub fn apply_discovery(&mut self, answer: &DiscoveryAnswer) {
        self.node_type = answer.node_type;
        self.node_subtype = answer.node_subtype;
        self.manufacturer = answer.manufacturer;
        self.multi_info = answer.multi_info;
        self.timestamp = answer.timestamp;
    }

    pub fn multi_info(&self) -> MultiInfo {
        MultiInfo::from_bytes([self.multi_info])
    }
}

/// Which bytes the post-pairing `0x3D` answer authenticates. Field peers
/// disagree; the accepted variant is recorded per device once tested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MacScope {
    /// MAC over the response command byte alone.
    #[default]
    ResponseByte,
    /// MAC over the recorded command byte plus payload.
    FullCommand,
}

/// The exact bytes of the most recent application command, kept so the MAC
/// can be recomputed when the device challenges it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCommand {
    pub command: Command,
    pub payload: Vec<u8>,
}

impl StoredCommand {
    /// Command byte followed by the payload, the authenticated form.
    pub fn frame_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.payload.len());
        out.push(self.command.into());
        out.extend_from_slice(&self.payload);
        out
    }
}

/// One known field device.
#[derive(Debug, Clone)]
pub struct Device {
    address: Address,
    pub pairing_state: PairingState,
    /// Monotonic instant of the last frame seen from this device.
    pub last_seen: Option<Instant>,
    /// Wall-clock mirror of `last_seen`, the only form that survives a restart.
    pub last_seen_unix: Option<u64>,
    pub pairing_started_at: Option<Instant>,
    pub system_key: Option<[u8; 16]>,
    pub stack_key: Option<[u8; 16]>,
    pub session_key: Option<[u8; 16]>,
    pub sequence_number: u16,
    pub last_challenge: Option<[u8; 6]>,
    pub last_response: Option<[u8; 6]>,
    pub pending_challenge: bool,
    pub last_command: Option<StoredCommand>,
    pub priority_addr: Option<Vec<u8>>,
    pub capabilities: Capabilities,
    pub description: String,
    pub mac_scope: MacScope,
}

impl Device {
    pub fn new(address: Address) -> Self {
        Device {
            address,
            pairing_state: PairingState::Unpaired,
            last_seen: None,
            last_seen_unix: None,
            pairing_started_at: None,
            system_key: None,
            stack_key: None,
            session_key: None,
            sequence_number: 0,
            last_challenge: None,
            last_response: None,
            pending_challenge: false,
            last_command: None,
            priority_addr: None,
            capabilities: Capabilities::default(),
            description: String::new(),
            mac_scope: MacScope::default(),
        }
    }

    /// Immutable once set; the hex string is a pure projection.
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_seen = Some(now);
        self.last_seen_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .ok()
            .map(|d| d.as_secs());
    }

    pub fn begin_pairing(&mut self, now: Instant) {
        self.pairing_state = PairingState::Discovering;
        self.pairing_started_at = Some(now);
        self.touch(now);
    }

    pub fn pairing_timed_out(&self, now: Instant) -> bool {
        if !self.pairing_state.is_in_progress() {
            return false;
        }
        match self.pairing_started_at {
            Some(start) => now.duration_since(start) > PAIRING_TIMEOUT,
            None => false,
        }
    }

    pub fn has_system_key(&self) -> bool {
        self.system_key.is_some()
    }

    /// Record a challenge from the device. The pending flag only arms when a
    /// command is on file to authenticate against.
    pub fn store_challenge(&mut self, challenge: [u8; 6]) {
        self.last_challenge = Some(challenge);
        self.pending_challenge = self.last_command.is_some();
    }

    pub fn clear_pending_challenge(&mut self) {
        self.pending_challenge = false;
    }

    pub fn store_command(&mut self, command: Command, payload: &[u8]) {
        self.last_command = Some(StoredCommand {
            command,
            payload: payload.to_vec(),
        });
    }

    pub fn clear_command(&mut self) {
        self.last_command = None;
        self.pending_challenge = false;
    }

    pub fn next_sequence(&mut self) -> u16 {
        let seq = self.sequence_number;
        self.sequence_number = self.sequence_number.wrapping_add(1);
        seq
    }
}

/// Durable projection of a [`Device`]: what the JSON store holds, keyed by
/// the six-hex-character address. Live-session state collapses to `UNPAIRED`
/// so a restart never resumes half a pairing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurableDevice {
    #[serde(default)]
    pub description: String,
    pub pairing_state: PairingState,
    #[serde(default)]
    pub last_seen: Option<u64>,
    #[serde(default, with = "hex_opt", skip_serializing_if = "Option::is_none")]
    pub system_key: Option<[u8; 16]>,
    #[serde(default, with = "hex_opt", skip_serializing_if = "Option::is_none")]
    pub stack_key: Option<[u8; 16]>,
    #[serde(default, with = "hex_opt", skip_serializing_if = "Option::is_none")]
    pub session_key: Option<[u8; 16]>,
    pub sequence: u16,
    #[serde(default, with = "hex_vec_opt", skip_serializing_if = "Option::is_none")]
    pub priority_addr: Option<Vec<u8>>,
    #[serde(flatten)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub mac_scope: MacScope,
}

impl From<&Device> for DurableDevice {
    fn from(device: &Device) -> Self {
        let pairing_state = if device.pairing_state.is_terminal() {
            device.pairing_state
        } else if device.pairing_state == PairingState::KeyExchanged {
            PairingState::KeyExchanged
        } else {
            PairingState::Unpaired
        };
        DurableDevice {
            description: device.description.clone(),
            pairing_state,
            last_seen: device.last_seen_unix,
            system_key: device.system_key,
            stack_key: device.stack_key,
            session_key: device.session_key,
            sequence: device.sequence_number,
            priority_addr: device.priority_addr.clone(),
            capabilities: device.capabilities.clone(),
            mac_scope: device.mac_scope,
        }
    }
}

impl DurableDevice {
    pub fn into_device(self, address: Address) -> Device {
        let mut device = Device::new(address);
        device.description = self.description;
        device.pairing_state = self.pairing_state;
        device.last_seen_unix = self.last_seen;
        device.system_key = self.system_key;
        device.stack_key = self.stack_key;
        device.session_key = self.session_key;
        device.sequence_number = self.sequence;
        device.priority_addr = self.priority_addr;
        device.capabilities = self.capabilities;
        device.mac_scope = self.mac_scope;
        device
    }
}

/// Hex-string serde for optional fixed-size byte blobs.
mod hex_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(
        value: &Option<[u8; N]>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_str(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<Option<[u8; N]>, D::Error> {
        let value: Option<String> = Option::deserialize(deserializer)?;
        match value {
            None => Ok(None),
            Some(s) => {
                let raw = hex::decode(&s).map_err(serde::de::Error::custom)?;
                let arr: [u8; N] = raw.as_slice().try_into().map_err(|_| {
                    serde::de::Error::custom(format!("expected {N} bytes, got {}", s.len() / 2))
                })?;
                Ok(Some(arr))
            }
        }
    }
}

/// Hex-string serde for optional variable-length blobs.
mod hex_vec_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_str(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let value: Option<String> = Option::deserialize(deserializer)?;
        match value {
            None => Ok(None),
            Some(s) => hex::decode(&s).map(Some).map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_answer_unpacks_type_fields() {
        // 0x1234 -> type 0x48, subtype 0x34
        let data = [0x12, 0x34, 0xaa, 0xbb, 0xcc, 0x07, 0b0101_0110, 0x01, 0x02];
        let answer = DiscoveryAnswer::parse(&data);
        assert_eq!(answer.node_type, 0x048);
        assert_eq!(answer.node_subtype, 0x34);
        assert_eq!(answer.manufacturer, 0x07);
        assert_eq!(answer.timestamp, 0x0102);

        let mut caps = Capabilities::default();
        caps.apply_discovery(&answer);
        let mi = caps.multi_info();
        assert_eq!(mi.turnaround_time(), 0b10);
        assert!(mi.sync_control_group());
        assert!(!mi.rf_unsupported());
        assert!(mi.io_nonmember());
        assert_eq!(mi.power_save_mode(), 0b10);
    }

    #[test]
    fn pending_challenge_requires_command() {
        let mut device = Device::new(Address::new([1, 2, 3]));
        device.store_challenge([0xaa; 6]);
        assert!(!device.pending_challenge);

        device.store_command(Command::Activate, &[0x01, 0xe7, 0x00, 0x00, 0x00, 0x00]);
        device.store_challenge([0xaa; 6]);
        assert!(device.pending_challenge);

        device.clear_command();
        assert!(!device.pending_challenge);
    }

    #[test]
    fn durable_projection_drops_live_session() {
        let mut device = Device::new(Address::new([1, 2, 3]));
        device.begin_pairing(Instant::now());
        device.pairing_state = PairingState::ChallengeSent;
        device.sequence_number = 42;
        let durable = DurableDevice::from(&device);
        assert_eq!(durable.pairing_state, PairingState::Unpaired);
        assert_eq!(durable.sequence, 42);
    }

    #[test]
    fn pairing_timeout_only_in_progress() {
        let start = Instant::now();
        let mut device = Device::new(Address::new([1, 2, 3]));
        assert!(!device.pairing_timed_out(start + PAIRING_TIMEOUT * 2));
        device.begin_pairing(start);
        assert!(!device.pairing_timed_out(start + PAIRING_TIMEOUT / 2));
        assert!(device.pairing_timed_out(start + PAIRING_TIMEOUT * 2));
        device.pairing_state = PairingState::Paired;
        assert!(!device.pairing_timed_out(start + PAIRING_TIMEOUT * 2));
    }
}
