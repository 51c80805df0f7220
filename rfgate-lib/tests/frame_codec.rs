//! Codec checks against captured reference frames.

mod common;

use common::*;
use rfgate_lib::error::GatewayError;

fn hex_to_bytes(data: &str) -> Vec<u8> {
    hex::decode(data).expect("valid hex")
}

#[test]
fn reference_ask_challenge_frame_roundtrips_exactly() {
    // Controller-side 0x31 with no payload, as captured on air.
    let raw = hex_to_bytes("4800feefeef00f0031fb60");
    let frame = Frame::decode(&raw).unwrap();
    assert_eq!(frame.command, Command::AskChallenge);
    assert_eq!(frame.source, Address::new([0xfe, 0xef, 0xee]));
    assert_eq!(frame.target, Address::new([0xf0, 0x0f, 0x00]));
    assert!(frame.payload.is_empty());
    assert!(!frame.one_way);

    assert_eq!(frame.encode().unwrap().as_ref(), raw.as_slice());
}

#[test]
fn reference_challenge_frame_decodes() {
    let raw = hex_to_bytes("0e00feefeef00f003c123456789abc5eb1");
    let frame = Frame::decode(&raw).unwrap();
    assert_eq!(frame.command, Command::Challenge);
    assert_eq!(frame.payload.as_ref(), hex_to_bytes("123456789abc"));
}

#[test]
fn reference_key_request_frame_carries_prio_flag() {
    let raw = hex_to_bytes("4e04feefeef00f0038123456789abc23b6");
    let frame = Frame::decode(&raw).unwrap();
    assert_eq!(frame.command, Command::ForceKeyExchange);
    assert!(frame.prio);
    assert!(!frame.lpm);
}

#[test]
fn reference_transfer_ack_frame_decodes() {
    let raw = hex_to_bytes("8800f00f00feefee335bfb");
    let frame = Frame::decode(&raw).unwrap();
    assert_eq!(frame.command, Command::KeyTransferAck);
    assert!(frame.payload.is_empty());
}

#[test]
fn truncated_frame_is_malformed() {
    let raw = hex_to_bytes("4800feefeef00f");
    assert!(matches!(
        Frame::decode(&raw),
        Err(GatewayError::MalformedFrame(_))
    ));
}

#[test]
fn oversized_payload_is_rejected_on_decode() {
    // Hand-build a frame claiming 22 payload bytes with a valid CRC.
    let mut body = vec![0u8; 9 + 22];
    body[0] = 0x48 | 0x16; // length field tracks the payload
    body[8] = 0x3c;
    let crc = crypto::frame_crc(&body).to_le_bytes();
    body.extend_from_slice(&crc);
    assert!(matches!(
        Frame::decode(&body),
        Err(GatewayError::PayloadTooLong(22))
    ));
}

#[test]
fn max_payload_roundtrips() {
    let frame = Frame::targeted(
        Address::CONTROLLER,
        Address::new([0x4c, 0x79, 0xdc]),
        Command::NameAnswer,
        &[0x41; 21],
    );
    let encoded = frame.encode().unwrap();
    assert_eq!(Frame::decode(&encoded).unwrap(), frame);
}
