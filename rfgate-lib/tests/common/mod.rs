//! Shared test utilities: a scripted peer device and frame builders.

// Shared across multiple test files; not every item is used in each one.
#![allow(dead_code)]

#[allow(unused_imports)]
pub use bytes::Bytes;
#[allow(unused_imports)]
pub use rfgate_lib::crypto;
#[allow(unused_imports)]
pub use rfgate_lib::device::{MacScope, PairingState};
#[allow(unused_imports)]
pub use rfgate_lib::packet::{Address, Command, Frame};
#[allow(unused_imports)]
pub use rfgate_lib::radio::{MemoryRadio, RadioState, TxRequest};
#[allow(unused_imports)]
pub use rfgate_lib::registry::DeviceRegistry;

pub const CONTROLLER: Address = Address::CONTROLLER;

/// System key used across the scripted flows.
#[allow(dead_code)]
pub const SYSTEM_KEY: [u8; 16] = [
    0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x10, 0x11, 0x12, 0x13, 0x14, 0x15,
    0x16,
];

/// A field device with scripted answers, addressed `4c79dc`.
pub struct PeerDevice {
    pub addr: Address,
}

#[allow(dead_code)]
impl PeerDevice {
    pub fn new() -> Self {
        PeerDevice {
            addr: Address::new([0x4c, 0x79, 0xdc]),
        }
    }

    fn reply(&self, command: Command, payload: &[u8]) -> Frame {
        Frame::targeted(self.addr, CONTROLLER, command, payload)
    }

    pub fn discovery_answer(&self) -> Frame {
        // type 0x048, subtype 0x34, manufacturer 0x07, multi-info 0x56,
        // timestamp 0x0102
        self.reply(
            Command::DiscoverAnswer,
            &[0x12, 0x34, 0x4c, 0x79, 0xdc, 0x07, 0x56, 0x01, 0x02],
        )
    }

    pub fn alive_ok(&self) -> Frame {
        self.reply(Command::AliveOk, &[])
    }

    pub fn priority_answer(&self) -> Frame {
        self.reply(Command::PriorityAddrAnswer, &[0x00, 0x1f])
    }

    pub fn challenge(&self, challenge: [u8; 6]) -> Frame {
        self.reply(Command::Challenge, &challenge)
    }

    pub fn challenge_answer(&self, mac: [u8; 6]) -> Frame {
        self.reply(Command::ChallengeAnswer, &mac)
    }

    pub fn key_transfer_ack(&self) -> Frame {
        self.reply(Command::KeyTransferAck, &[])
    }

    pub fn pairing_confirm(&self) -> Frame {
        self.reply(Command::PairingConfirm, &[0x01])
    }

    pub fn name_answer(&self, name: &str) -> Frame {
        let mut payload = [0u8; 16];
        payload[..name.len()].copy_from_slice(name.as_bytes());
        self.reply(Command::NameAnswer, &payload)
    }

    pub fn general_info1(&self) -> Frame {
        self.reply(Command::GeneralInfo1Answer, &[0xa1; 14])
    }

    pub fn general_info2(&self) -> Frame {
        self.reply(Command::GeneralInfo2Answer, &[0xb2; 16])
    }

    pub fn status_reply(&self) -> Frame {
        self.reply(Command::StatusReply, &[0x2d, 0x01, 0xc8])
    }

    pub fn error(&self, status: u8) -> Frame {
        self.reply(Command::Error, &[status])
    }
}

/// Commands of everything a radio sent, in order.
#[allow(dead_code)]
pub fn sent_commands(radio: &MemoryRadio) -> Vec<Command> {
    radio.sent().iter().map(|tx| tx.frame.command).collect()
}
