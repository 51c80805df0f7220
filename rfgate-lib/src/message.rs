//! Typed view of inbound frames.
//!
//! The codec hands over a [`Frame`]; dispatch wants the payload parsed and
//! length-checked exactly once. A frame whose payload is too short for its
//! command is a framing error, so a malformed discovery answer can never
//! reach the registry.

use crate::device::DiscoveryAnswer;
use crate::error::GatewayError;
use crate::packet::{Command, Frame};
use bytes::Bytes;

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Application command `0x00` (activate / on / off).
    Activate { payload: Bytes },
    /// Application status query `0x03`.
    StatusQuery { payload: Bytes },
    /// Application reply `0x04`.
    StatusReply { payload: Bytes },
    Discover,
    DiscoverAnswer(DiscoveryAnswer),
    PairingBroadcast { payload: Bytes },
    AliveCheck,
    AliveOk,
    LearningMode { mode: u8 },
    PairingConfirm,
    AskChallenge,
    KeyTransfer { wrapped_key: [u8; 16] },
    KeyTransferAck,
    PriorityAddrRequest,
    /// Per-device priority identifier; observed lengths vary, stored opaquely.
    PriorityAddrAnswer { addr: Bytes },
    ForceKeyExchange { challenge: [u8; 6] },
    Challenge { challenge: [u8; 6] },
    ChallengeAnswer { mac: [u8; 6] },
    NameRequest,
    NameAnswer { name: String },
    GeneralInfo1Request,
    GeneralInfo1Answer { info: [u8; 14] },
    GeneralInfo2Request,
    GeneralInfo2Answer { info: [u8; 16] },
    Error { status: u8 },
}

fn need(payload: &Bytes, len: usize, what: &str) -> Result<(), GatewayError> {
    if payload.len() < len {
        return Err(GatewayError::MalformedFrame(format!(
            "{what} needs {len} payload bytes, got {}",
            payload.len()
        )));
    }
    Ok(())
}

fn array<const N: usize>(payload: &Bytes) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&payload[..N]);
    out
}

/// Device names come as a fixed block, null-terminated when shorter.
fn parse_name(payload: &Bytes) -> String {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end]).into_owned()
}

impl TryFrom<&Frame> for Message {
    type Error = GatewayError;

    fn try_from(frame: &Frame) -> Result<Self, GatewayError> {
        let p = &frame.payload;
        let msg = match frame.command {
            Command::Activate => Message::Activate { payload: p.clone() },
            Command::StatusQuery => Message::StatusQuery { payload: p.clone() },
            Command::StatusReply => Message::StatusReply { payload: p.clone() },
            Command::Discover => Message::Discover,
            Command::DiscoverAnswer => {
                need(p, 9, "discovery answer")?;
                Message::DiscoverAnswer(DiscoveryAnswer::parse(&p[..9]))
            }
            Command::PairingBroadcast => Message::PairingBroadcast { payload: p.clone() },
            Command::AliveCheck => Message::AliveCheck,
            Command::AliveOk => Message::AliveOk,
            Command::LearningMode => {
                need(p, 1, "learning mode")?;
                Message::LearningMode { mode: p[0] }
            }
            Command::PairingConfirm => Message::PairingConfirm,
            Command::AskChallenge => Message::AskChallenge,
            Command::KeyTransfer => {
                need(p, 16, "key transfer")?;
                Message::KeyTransfer {
                    wrapped_key: array(p),
                }
            }
            Command::KeyTransferAck => Message::KeyTransferAck,
            Command::PriorityAddrRequest => Message::PriorityAddrRequest,
            Command::PriorityAddrAnswer => Message::PriorityAddrAnswer { addr: p.clone() },
            Command::ForceKeyExchange => {
                need(p, 6, "key exchange request")?;
                Message::ForceKeyExchange {
                    challenge: array(p),
                }
            }
            Command::Challenge => {
                need(p, 6, "challenge")?;
                Message::Challenge {
                    challenge: array(p),
                }
            }
            Command::ChallengeAnswer => {
                need(p, 6, "challenge answer")?;
                Message::ChallengeAnswer { mac: array(p) }
            }
            Command::NameRequest => Message::NameRequest,
            Command::NameAnswer => {
                need(p, 16, "name answer")?;
                Message::NameAnswer {
                    name: parse_name(p),
                }
            }
            Command::GeneralInfo1Request => Message::GeneralInfo1Request,
            Command::GeneralInfo1Answer => {
                need(p, 14, "general info 1")?;
                Message::GeneralInfo1Answer { info: array(p) }
            }
            Command::GeneralInfo2Request => Message::GeneralInfo2Request,
            Command::GeneralInfo2Answer => {
                need(p, 16, "general info 2")?;
                Message::GeneralInfo2Answer { info: array(p) }
            }
            Command::Error => {
                need(p, 1, "error status")?;
                Message::Error { status: p[0] }
            }
            Command::KeyPush1W => {
                return Err(GatewayError::MalformedFrame(
                    "one-way key push is transmit-only".to_string(),
                ))
            }
        };
        Ok(msg)
    }
}
