//! Authenticated-control scenarios: command, challenge, MAC answer,
//! confirmation.

mod common;

use common::*;
use rfgate_lib::gateway::{Gateway, GatewayConfig};
use std::time::Instant;

const CHALLENGE: [u8; 6] = [0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc];

fn gateway() -> Gateway<MemoryRadio> {
    let dir = tempfile::tempdir().unwrap().keep();
    let config = GatewayConfig {
        system_key: Some(SYSTEM_KEY),
        registry_path: dir.join("devices.json"),
        ..GatewayConfig::default()
    };
    Gateway::new(config, MemoryRadio::new()).unwrap()
}

fn gateway_with_paired_peer() -> (Gateway<MemoryRadio>, PeerDevice) {
    let mut gw = gateway();
    let peer = PeerDevice::new();
    let now = Instant::now();
    let device = gw.registry_mut().get_or_create(peer.addr);
    device.pairing_state = PairingState::Paired;
    device.system_key = Some(SYSTEM_KEY);
    device.touch(now);
    (gw, peer)
}

#[test]
fn authenticated_switch_on() {
    let (mut gw, peer) = gateway_with_paired_peer();
    let now = Instant::now();

    gw.switch(peer.addr, true, now).unwrap();
    {
        let sent = gw.radio().sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].frame.command, Command::Activate);
        assert_eq!(
            sent[0].frame.payload.as_ref(),
            [0x01, 0xe7, 0x00, 0x00, 0x00, 0x00]
        );
    }

    gw.dispatch(&peer.challenge(CHALLENGE), now);
    {
        let sent = gw.radio().sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].frame.command, Command::ChallengeAnswer);
        // Default scope authenticates the response byte alone.
        let expected = crypto::mac_2w(&CHALLENGE, &SYSTEM_KEY, &[0x3d]);
        assert_eq!(sent[1].frame.payload.as_ref(), expected);
    }

    let device = gw.registry().get(peer.addr).unwrap();
    assert!(!device.pending_challenge);
    assert_eq!(device.last_challenge, Some(CHALLENGE));
    assert!(device.last_response.is_some());

    gw.dispatch(&peer.status_reply(), now);
    assert!(gw.registry().get(peer.addr).unwrap().last_seen.is_some());
}

#[test]
fn full_command_scope_authenticates_command_bytes() {
    let (mut gw, peer) = gateway_with_paired_peer();
    gw.registry_mut().get_mut(peer.addr).unwrap().mac_scope = MacScope::FullCommand;
    let now = Instant::now();

    gw.switch(peer.addr, false, now).unwrap();
    gw.dispatch(&peer.challenge(CHALLENGE), now);

    let sent = gw.radio().sent();
    let expected = crypto::mac_2w(
        &CHALLENGE,
        &SYSTEM_KEY,
        &[0x00, 0x01, 0xe7, 0xc8, 0x00, 0x00, 0x00],
    );
    assert_eq!(sent[1].frame.payload.as_ref(), expected);
}

#[test]
fn challenge_from_unknown_address_dropped() {
    let mut gw = gateway();
    let peer = PeerDevice::new();
    gw.dispatch(&peer.challenge(CHALLENGE), Instant::now());
    assert!(gw.radio().sent().is_empty());
    // Dropping means dropping: the device is not even created.
    assert!(gw.registry().get(peer.addr).is_none());
}

#[test]
fn challenge_without_system_key_dropped() {
    let mut gw = gateway();
    let peer = PeerDevice::new();
    let now = Instant::now();
    let device = gw.registry_mut().get_or_create(peer.addr);
    device.pairing_state = PairingState::Paired;
    device.store_command(Command::Activate, &[0x01, 0xe7, 0x00, 0x00, 0x00, 0x00]);

    gw.dispatch(&peer.challenge(CHALLENGE), now);
    assert!(gw.radio().sent().is_empty());
    assert!(!gw.registry().get(peer.addr).unwrap().pending_challenge);
}

#[test]
fn challenge_without_recorded_command_dropped() {
    let (mut gw, peer) = gateway_with_paired_peer();
    gw.dispatch(&peer.challenge(CHALLENGE), Instant::now());
    assert!(gw.radio().sent().is_empty());
    let device = gw.registry().get(peer.addr).unwrap();
    assert!(!device.pending_challenge);
    assert!(device.last_challenge.is_none());
}

#[test]
fn commands_require_paired_state() {
    let mut gw = gateway();
    let peer = PeerDevice::new();
    let now = Instant::now();
    assert!(gw.switch(peer.addr, true, now).is_err());

    gw.registry_mut().get_or_create(peer.addr);
    assert!(gw.switch(peer.addr, true, now).is_err());
    assert!(gw.radio().sent().is_empty());
}

#[test]
fn sequence_number_advances_per_command() {
    let (mut gw, peer) = gateway_with_paired_peer();
    let now = Instant::now();
    gw.switch(peer.addr, true, now).unwrap();
    gw.switch(peer.addr, false, now).unwrap();
    gw.status_query(peer.addr, now).unwrap();
    assert_eq!(gw.registry().get(peer.addr).unwrap().sequence_number, 3);
}

#[test]
fn key_pull_answered_with_wrapped_key() {
    let (mut gw, peer) = gateway_with_paired_peer();
    let now = Instant::now();
    let frame = Frame::targeted(peer.addr, CONTROLLER, Command::ForceKeyExchange, &CHALLENGE);
    gw.dispatch(&frame, now);

    let sent = gw.radio().sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].frame.command, Command::KeyTransfer);
    let mut frame38 = vec![0x38];
    frame38.extend_from_slice(&CHALLENGE);
    let expected = crypto::wrap_key(&SYSTEM_KEY, &CHALLENGE, &frame38, &crypto::TRANSFER_KEY);
    assert_eq!(sent[0].frame.payload.as_ref(), expected);

    // The wrap keystream is recorded as the device's stack key.
    assert_eq!(
        gw.registry().get(peer.addr).unwrap().stack_key,
        Some(crypto::transfer_pad(&CHALLENGE, &frame38, &crypto::TRANSFER_KEY))
    );
}

#[test]
fn raw_command_records_last_command() {
    let (mut gw, peer) = gateway_with_paired_peer();
    let now = Instant::now();
    gw.raw_command(peer.addr, 0x03, &[0x2d, 0x01, 0xc8], now).unwrap();
    let device = gw.registry().get(peer.addr).unwrap();
    let stored = device.last_command.as_ref().unwrap();
    assert_eq!(stored.command, Command::StatusQuery);
    assert_eq!(stored.frame_bytes(), vec![0x03, 0x2d, 0x01, 0xc8]);

    // Unknown command bytes are refused before anything is sent.
    assert!(gw.raw_command(peer.addr, 0x77, &[], now).is_err());
}
