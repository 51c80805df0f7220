//! On-air frame codec.
//!
//! ```text
//! preamble | sync | CtrlByte1 | CtrlByte2 | src[3] | tgt[3] | cmd | payload[0..21] | crc16
//! ```
//!
//! Preamble and sync are produced by the radio; everything from `CtrlByte1`
//! onward is handled here. `CtrlByte1` packs the running length field, the
//! protocol selector and the start/end-of-frame bits; `CtrlByte2` carries the
//! `LPM` (wake sleeping peers with a long preamble) and `Prio` flags. The
//! CRC-16 closes the frame, low byte first.

use crate::constants::{HEADER_LEN, MAX_PAYLOAD, MSG_LEN_BASE};
use crate::crypto::frame_crc;
use crate::error::GatewayError;
use bytes::{BufMut, Bytes, BytesMut};
use modular_bitfield::prelude::*;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Three-byte node identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; 3]);

impl Address {
    /// Reserved target for two-way broadcasts.
    pub const BROADCAST: Address = Address([0x00, 0x00, 0x3b]);

    /// Identity used in the source field of controller frames. Any fixed
    /// triple works as long as it does not collide with a known peer.
    pub const CONTROLLER: Address = Address([0xba, 0x11, 0xad]);

    pub const fn new(bytes: [u8; 3]) -> Self {
        Address(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 3] {
        &self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Address {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s).map_err(|_| GatewayError::InvalidAddress(s.to_string()))?;
        let bytes: [u8; 3] = raw
            .as_slice()
            .try_into()
            .map_err(|_| GatewayError::InvalidAddress(s.to_string()))?;
        Ok(Address(bytes))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[bitfield(bytes = 1)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CtrlByte1 {
    pub msg_len: B5,
    pub protocol: bool,
    pub start_frame: bool,
    pub end_frame: bool,
}

#[bitfield(bytes = 1)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CtrlByte2 {
    pub lpm: bool,
    #[skip]
    reserved_low: bool,
    pub prio: bool,
    #[skip]
    reserved: B5,
}

/// Command catalog. Decoding an unlisted byte is a framing error; the frame
/// is dropped without touching any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Command {
    Activate = 0x00,
    StatusQuery = 0x03,
    StatusReply = 0x04,
    Discover = 0x28,
    DiscoverAnswer = 0x29,
    PairingBroadcast = 0x2a,
    AliveCheck = 0x2c,
    AliveOk = 0x2d,
    LearningMode = 0x2e,
    PairingConfirm = 0x2f,
    KeyPush1W = 0x30,
    AskChallenge = 0x31,
    KeyTransfer = 0x32,
    KeyTransferAck = 0x33,
    PriorityAddrRequest = 0x36,
    PriorityAddrAnswer = 0x37,
    ForceKeyExchange = 0x38,
    Challenge = 0x3c,
    ChallengeAnswer = 0x3d,
    NameRequest = 0x50,
    NameAnswer = 0x51,
    GeneralInfo1Request = 0x54,
    GeneralInfo1Answer = 0x55,
    GeneralInfo2Request = 0x56,
    GeneralInfo2Answer = 0x57,
    Error = 0xfe,
}

/// A decoded on-air frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Protocol selector bit; set on the legacy one-way variant.
    pub one_way: bool,
    /// Low-power-mode flag: the radio prepends a long preamble so sleeping
    /// peers wake in time to hear the frame.
    pub lpm: bool,
    /// Priority flag.
    pub prio: bool,
    pub source: Address,
    pub target: Address,
    pub command: Command,
    pub payload: Bytes,
}

impl Frame {
    /// Targeted two-way frame from the controller.
    pub fn targeted(source: Address, target: Address, command: Command, payload: &[u8]) -> Self {
        Frame {
            one_way: false,
            lpm: false,
            prio: false,
            source,
            target,
            command,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    /// Broadcast two-way frame from the controller.
    pub fn broadcast(source: Address, command: Command, payload: &[u8]) -> Self {
        Self::targeted(source, Address::BROADCAST, command, payload)
    }

    pub fn with_lpm(mut self) -> Self {
        self.lpm = true;
        self
    }

    pub fn with_prio(mut self) -> Self {
        self.prio = true;
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.target.is_broadcast()
    }

    /// Serialize to on-air bytes, CRC included.
    pub fn encode(&self) -> Result<Bytes, GatewayError> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(GatewayError::PayloadTooLong(self.payload.len()));
        }
        let ctrl1 = CtrlByte1::new()
            .with_msg_len(MSG_LEN_BASE + self.payload.len() as u8)
            .with_protocol(self.one_way)
            .with_start_frame(true)
            .with_end_frame(false);
        let ctrl2 = CtrlByte2::new().with_lpm(self.lpm).with_prio(self.prio);

        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len() + 2);
        buf.put_u8(ctrl1.into_bytes()[0]);
        buf.put_u8(ctrl2.into_bytes()[0]);
        buf.put_slice(self.source.as_bytes());
        buf.put_slice(self.target.as_bytes());
        buf.put_u8(self.command.into());
        buf.put_slice(&self.payload);
        let crc = frame_crc(&buf);
        buf.put_u16_le(crc);
        Ok(buf.freeze())
    }

    /// Parse on-air bytes. Total: every defect maps to an error and the
    /// caller drops the frame without any state change.
    pub fn decode(raw: &[u8]) -> Result<Frame, GatewayError> {
        if raw.len() < HEADER_LEN + 2 {
            return Err(GatewayError::MalformedFrame(format!(
                "{} bytes is shorter than header plus CRC",
                raw.len()
            )));
        }
        let (body, crc_bytes) = raw.split_at(raw.len() - 2);
        let received = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
        let computed = frame_crc(body);
        if received != computed {
            return Err(GatewayError::CrcMismatch { computed, received });
        }

        let ctrl1 = CtrlByte1::from_bytes([body[0]]);
        let ctrl2 = CtrlByte2::from_bytes([body[1]]);
        let payload = &body[HEADER_LEN..];
        if payload.len() > MAX_PAYLOAD {
            return Err(GatewayError::PayloadTooLong(payload.len()));
        }
        let expected_len = MSG_LEN_BASE + payload.len() as u8;
        if ctrl1.msg_len() != expected_len {
            return Err(GatewayError::MalformedFrame(format!(
                "length field {} does not match {} payload bytes",
                ctrl1.msg_len(),
                payload.len()
            )));
        }
        let command = Command::try_from(body[8]).map_err(|_| GatewayError::UnknownCommand(body[8]))?;

        Ok(Frame {
            one_way: ctrl1.protocol(),
            lpm: ctrl2.lpm(),
            prio: ctrl2.prio(),
            source: Address::new([body[2], body[3], body[4]]),
            target: Address::new([body[5], body[6], body[7]]),
            command,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_display_and_parse() {
        let addr: Address = "ba11ad".parse().unwrap();
        assert_eq!(addr, Address::CONTROLLER);
        assert_eq!(addr.to_string(), "ba11ad");
        assert!("ba11".parse::<Address>().is_err());
        assert!("zz11ad".parse::<Address>().is_err());
    }

    #[test]
    fn encode_decode_roundtrip() {
        let frame = Frame::targeted(
            Address::CONTROLLER,
            Address::new([0x4c, 0x79, 0xdc]),
            Command::Challenge,
            &[0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc],
        );
        let encoded = frame.encode().unwrap();
        assert_eq!(Frame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn broadcast_flags_roundtrip() {
        let frame = Frame::broadcast(Address::CONTROLLER, Command::Discover, &[])
            .with_lpm()
            .with_prio();
        let encoded = frame.encode().unwrap();
        let decoded = Frame::decode(&encoded).unwrap();
        assert!(decoded.is_broadcast());
        assert!(decoded.lpm);
        assert!(decoded.prio);
    }

    #[test]
    fn corrupted_crc_rejected() {
        let frame = Frame::targeted(
            Address::CONTROLLER,
            Address::new([0x4c, 0x79, 0xdc]),
            Command::AliveCheck,
            &[],
        );
        let mut raw = frame.encode().unwrap().to_vec();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        assert!(matches!(
            Frame::decode(&raw),
            Err(GatewayError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn inconsistent_length_field_rejected() {
        let frame = Frame::targeted(
            Address::CONTROLLER,
            Address::new([0x4c, 0x79, 0xdc]),
            Command::AliveCheck,
            &[],
        );
        let mut raw = frame.encode().unwrap().to_vec();
        raw[0] = CtrlByte1::new()
            .with_msg_len(MSG_LEN_BASE + 3)
            .with_start_frame(true)
            .into_bytes()[0];
        let body_len = raw.len() - 2;
        let crc = frame_crc(&raw[..body_len]).to_le_bytes();
        raw[body_len] = crc[0];
        raw[body_len + 1] = crc[1];
        assert!(matches!(
            Frame::decode(&raw),
            Err(GatewayError::MalformedFrame(_))
        ));
    }

    #[test]
    fn unknown_command_rejected() {
        let frame = Frame::targeted(
            Address::CONTROLLER,
            Address::new([0x4c, 0x79, 0xdc]),
            Command::AliveCheck,
            &[],
        );
        let mut raw = frame.encode().unwrap().to_vec();
        raw[8] = 0x77;
        let body_len = raw.len() - 2;
        let crc = frame_crc(&raw[..body_len]).to_le_bytes();
        raw[body_len] = crc[0];
        raw[body_len + 1] = crc[1];
        assert!(matches!(
            Frame::decode(&raw),
            Err(GatewayError::UnknownCommand(0x77))
        ));
    }

    #[test]
    fn oversized_payload_refused_on_encode() {
        let frame = Frame::targeted(
            Address::CONTROLLER,
            Address::new([0x4c, 0x79, 0xdc]),
            Command::Activate,
            &[0u8; 22],
        );
        assert!(matches!(
            frame.encode(),
            Err(GatewayError::PayloadTooLong(22))
        ));
    }
}
