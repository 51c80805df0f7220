//! Cryptographic primitives for the two-way protocol.
//!
//! Everything here is pure and operates on fixed-size blocks:
//!
//! 1. A 16-byte *initial value* (IV) is derived from the frame bytes being
//!    authenticated and a 6-byte challenge.
//! 2. Key transport encrypts that IV with AES-128-ECB under the family-wide
//!    transfer key and XORs the result with the key being shipped.
//! 3. The 2W MAC encrypts the IV under the per-device system key and keeps
//!    the first six bytes of the ciphertext.
//! 4. The 1W variant reuses the same IV construction with the 2-byte rolling
//!    sequence number standing in for the challenge.
//!
//! A 16-bit CRC (CRC-16/KERMIT) closes every on-air frame; it is appended by
//! the packet codec and is independent of the primitives above.

use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use crc::{Crc, CRC_16_KERMIT};

use crate::packet::Address;

/// Family-wide AES-128 transfer key, provisioned in device firmware at
/// manufacture. Every peer of the protocol family holds the same value.
pub const TRANSFER_KEY: [u8; 16] = [
    0x6b, 0x3d, 0x8a, 0xf2, 0x51, 0xc9, 0x07, 0xe4, 0x9e, 0x60, 0xb5, 0x2c, 0x48, 0xd1, 0x73, 0x1a,
];

/// Challenge nonce length.
pub const CHALLENGE_LEN: usize = 6;

/// Truncated MAC length.
pub const MAC_LEN: usize = 6;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_KERMIT);

/// Running two-byte checksum over a byte stream.
///
/// Per input byte: `c1 = rotl1(c1 ^ b)` then `c2 = c2 + c1` (mod 256).
pub fn rolling_checksum(data: &[u8]) -> (u8, u8) {
    let mut c1: u8 = 0;
    let mut c2: u8 = 0;
    for &b in data {
        c1 = (c1 ^ b).rotate_left(1);
        c2 = c2.wrapping_add(c1);
    }
    (c1, c2)
}

/// Build the 16-byte initial value from authenticated frame bytes and a
/// 6-byte challenge.
///
/// Bytes 0..8 take the first eight frame bytes, padded with `0x55` when the
/// frame is shorter. Bytes 8..10 take the rolling checksum over the *whole*
/// frame, not just the copied prefix. Bytes 10..16 take the challenge.
pub fn build_initial_value(frame: &[u8], challenge: &[u8; CHALLENGE_LEN]) -> [u8; 16] {
    let mut iv = [0x55u8; 16];
    for (i, &b) in frame.iter().take(8).enumerate() {
        iv[i] = b;
    }
    let (c1, c2) = rolling_checksum(frame);
    iv[8] = c1;
    iv[9] = c2;
    iv[10..16].copy_from_slice(challenge);
    iv
}

/// AES-128-ECB encrypt a single 16-byte block.
fn aes_ecb_encrypt_block(key: &[u8; 16], block: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(key.into());
    let mut out = *block;
    cipher.encrypt_block((&mut out).into());
    out
}

/// Keystream block the key wrap XORs against: AES-128-ECB of the IV under
/// the transfer key. Both peers keep it after a key transfer as the stack
/// key.
pub fn transfer_pad(
    challenge: &[u8; CHALLENGE_LEN],
    frame: &[u8],
    transfer_key: &[u8; 16],
) -> [u8; 16] {
    let iv = build_initial_value(frame, challenge);
    aes_ecb_encrypt_block(transfer_key, &iv)
}

/// Wrap a 16-byte key for transport inside a `0x32` key-transfer frame.
///
/// The IV derived from `(frame, challenge)` is encrypted under the transfer
/// key and XORed with the target key. Unwrapping is the same operation, so
/// `unwrap_key` is an alias kept for readability at call sites.
pub fn wrap_key(
    key: &[u8; 16],
    challenge: &[u8; CHALLENGE_LEN],
    frame: &[u8],
    transfer_key: &[u8; 16],
) -> [u8; 16] {
    let pad = transfer_pad(challenge, frame, transfer_key);
    let mut out = [0u8; 16];
    for i in 0..16 {
        out[i] = key[i] ^ pad[i];
    }
    out
}

/// Recover a key wrapped by [`wrap_key`] with identical inputs.
pub fn unwrap_key(
    wrapped: &[u8; 16],
    challenge: &[u8; CHALLENGE_LEN],
    frame: &[u8],
    transfer_key: &[u8; 16],
) -> [u8; 16] {
    wrap_key(wrapped, challenge, frame, transfer_key)
}

/// Full cipher block behind the truncated 2W MAC. Protocol variants that
/// key their session traffic take it from the pairing challenge exchange.
pub fn session_key_2w(
    challenge: &[u8; CHALLENGE_LEN],
    system_key: &[u8; 16],
    frame: &[u8],
) -> [u8; 16] {
    let iv = build_initial_value(frame, challenge);
    aes_ecb_encrypt_block(system_key, &iv)
}

/// Two-way MAC: first six bytes of AES-128-ECB over the IV under the
/// per-device system key.
pub fn mac_2w(
    challenge: &[u8; CHALLENGE_LEN],
    system_key: &[u8; 16],
    frame: &[u8],
) -> [u8; MAC_LEN] {
    let block = session_key_2w(challenge, system_key, frame);
    let mut mac = [0u8; MAC_LEN];
    mac.copy_from_slice(&block[..MAC_LEN]);
    mac
}

/// One-way MAC: identical to [`mac_2w`] with the challenge slot holding the
/// 2-byte sequence number followed by four zero bytes.
pub fn mac_1w(sequence: u16, controller_key: &[u8; 16], frame: &[u8]) -> [u8; MAC_LEN] {
    let seq = sequence.to_be_bytes();
    let challenge = [seq[0], seq[1], 0, 0, 0, 0];
    mac_2w(&challenge, controller_key, frame)
}

/// Wrap the controller key for a one-way device.
///
/// The wrapping key is the 3-byte device address tiled across 16 bytes; the
/// cleartext key is encrypted under it with AES-128-ECB.
pub fn wrap_key_1w(address: Address, controller_key: &[u8; 16]) -> [u8; 16] {
    let addr = address.as_bytes();
    let mut derived = [0u8; 16];
    for (i, byte) in derived.iter_mut().enumerate() {
        *byte = addr[i % 3];
    }
    aes_ecb_encrypt_block(&derived, controller_key)
}

/// CRC-16 over the on-air frame body (header plus payload, without the CRC
/// bytes themselves). Appended to the frame low byte first.
pub fn frame_crc(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHALLENGE: [u8; 6] = [0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc];
    const KEY_A: [u8; 16] = [
        0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x10, 0x11, 0x12, 0x13, 0x14, 0x15,
        0x16,
    ];
    const KEY_B: [u8; 16] = [
        0xab, 0xcd, 0xef, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x10, 0x11, 0x12,
        0x13,
    ];

    #[test]
    fn checksum_single_byte() {
        assert_eq!(rolling_checksum(&[0x31]), (0x62, 0x62));
        assert_eq!(rolling_checksum(&[0x3d]), (0x7a, 0x7a));
    }

    #[test]
    fn initial_value_layout() {
        let iv = build_initial_value(&[0x31], &CHALLENGE);
        assert_eq!(
            iv,
            [
                0x31, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x62, 0x62, 0x12, 0x34, 0x56,
                0x78, 0x9a, 0xbc
            ]
        );
    }

    #[test]
    fn initial_value_long_frame_feeds_checksum() {
        // Bytes beyond the 8-byte prefix must still change the checksum.
        let short = build_initial_value(&[1, 2, 3, 4, 5, 6, 7, 8], &CHALLENGE);
        let long = build_initial_value(&[1, 2, 3, 4, 5, 6, 7, 8, 9], &CHALLENGE);
        assert_eq!(short[..8], long[..8]);
        assert_ne!(short[8..10], long[8..10]);
    }

    #[test]
    fn key_push_wrap_vector() {
        // Key push: wrap against the preceding ask-challenge frame {0x31}.
        let wrapped = wrap_key(&KEY_A, &CHALLENGE, &[0x31], &TRANSFER_KEY);
        assert_eq!(hex::encode(wrapped), "4a41ebe80872246424c9d797e19eed72");

        let mut frame32 = vec![0x32];
        frame32.extend_from_slice(&wrapped);
        let mac = mac_2w(&CHALLENGE, &KEY_A, &frame32);
        assert_eq!(hex::encode(mac), "f2c1ff96bb94");
    }

    #[test]
    fn key_pull_wrap_vector() {
        // Key pull: wrap against the device's {0x38 ‖ challenge} request.
        let mut frame38 = vec![0x38];
        frame38.extend_from_slice(&CHALLENGE);
        let wrapped = wrap_key(&KEY_B, &CHALLENGE, &frame38, &TRANSFER_KEY);
        assert_eq!(hex::encode(wrapped), "d8aebba5dd30b3343ab7e52a2b8d65e2");

        let mut frame32 = vec![0x32];
        frame32.extend_from_slice(&wrapped);
        let mac = mac_2w(&CHALLENGE, &KEY_B, &frame32);
        assert_eq!(hex::encode(mac), "ca5114805ba4");
    }

    #[test]
    fn response_mac_vector() {
        // Post-pairing control authenticates the response byte alone.
        let mac = mac_2w(&CHALLENGE, &KEY_B, &[0x3d]);
        assert_eq!(hex::encode(mac), "56270ba4ced1");
    }

    #[test]
    fn one_way_key_push_vector() {
        let addr = Address::new([0xab, 0xcd, 0xef]);
        let wrapped = wrap_key_1w(addr, &KEY_A);
        assert_eq!(hex::encode(wrapped), "6a7ccc98b8acb23a2873b69fdc4adbe4");

        let mut frame = vec![0x30];
        frame.extend_from_slice(&wrapped);
        let mac = mac_1w(0x1234, &KEY_A, &frame);
        assert_eq!(hex::encode(mac), "4a9370e44d6a");
    }

    #[test]
    fn mac_is_session_key_prefix() {
        let block = session_key_2w(&CHALLENGE, &KEY_A, &[0x3d]);
        assert_eq!(mac_2w(&CHALLENGE, &KEY_A, &[0x3d]), block[..6]);
    }

    #[test]
    fn wrap_xors_against_transfer_pad() {
        let pad = transfer_pad(&CHALLENGE, &[0x31], &TRANSFER_KEY);
        let wrapped = wrap_key(&KEY_A, &CHALLENGE, &[0x31], &TRANSFER_KEY);
        for i in 0..16 {
            assert_eq!(wrapped[i] ^ pad[i], KEY_A[i]);
        }
    }

    #[test]
    fn wrap_unwrap_roundtrip() {
        let frames: [&[u8]; 3] = [&[0x31], &[0x38, 0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc], &[]];
        for frame in frames {
            let wrapped = wrap_key(&KEY_A, &CHALLENGE, frame, &TRANSFER_KEY);
            assert_eq!(unwrap_key(&wrapped, &CHALLENGE, frame, &TRANSFER_KEY), KEY_A);
        }
    }

    #[test]
    fn mac_depends_on_every_frame_byte() {
        let frame: Vec<u8> = (0u8..17).collect();
        let base = mac_2w(&CHALLENGE, &KEY_A, &frame);
        for i in 0..frame.len() {
            for bit in 0..8 {
                let mut mutated = frame.clone();
                mutated[i] ^= 1 << bit;
                assert_ne!(
                    mac_2w(&CHALLENGE, &KEY_A, &mutated),
                    base,
                    "flipping byte {i} bit {bit} left the MAC unchanged"
                );
            }
        }
    }

    #[test]
    fn frame_crc_reference_frames() {
        let cases = [
            ("4800feefeef00f0031", 0x60fb_u16),
            ("0e00feefeef00f003c123456789abc", 0xb15e),
            ("8800f00f00feefee33", 0xfb5b),
            ("4e04feefeef00f0038123456789abc", 0xb623),
        ];
        for (frame_hex, expected) in cases {
            let data = hex::decode(frame_hex).unwrap();
            assert_eq!(frame_crc(&data), expected, "frame {frame_hex}");
        }
    }
}
