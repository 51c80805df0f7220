//! Protocol constants: command catalog, timings, fixed payloads.

use std::time::Duration;

/// Maximum on-air payload length after the command byte.
pub const MAX_PAYLOAD: usize = 21;

/// On-air header length: two control bytes, source, target, command.
pub const HEADER_LEN: usize = 9;

/// The length field counts header bytes minus one plus payload bytes.
pub const MSG_LEN_BASE: u8 = (HEADER_LEN - 1) as u8;

/// Fixed 12-byte payload carried by the `0x2A` pairing broadcast.
pub const PAIRING_BROADCAST_PAYLOAD: [u8; 12] = [
    0x01, 0x65, 0x04, 0x61, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Number of `0x2A` broadcast repetitions before moving on.
pub const PAIRING_BROADCAST_REPEATS: u8 = 4;

/// Interval between successive `0x2A` broadcasts.
pub const PAIRING_BROADCAST_INTERVAL: Duration = Duration::from_millis(250);

/// Retransmit interval for the `0x28` discovery broadcast.
pub const DISCOVERY_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Advisory wait for a single expected reply; logged, never fatal.
pub const STEP_WAIT: Duration = Duration::from_secs(5);

/// Umbrella timeout for a whole pairing session.
pub const PAIRING_TIMEOUT: Duration = Duration::from_secs(30);

/// Base delay between automatic retransmissions of a pending send.
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Attempts allowed for one pending send before giving up on it.
pub const RETRY_BUDGET: u8 = 5;

/// Settle time granted to a sleeping peer after a long-preamble broadcast.
pub const POST_BROADCAST_DELAY: Duration = Duration::from_millis(250);

/// Consecutive `0xFE 08` replies tolerated before aborting the session.
pub const PEER_NOT_READY_LIMIT: u8 = 6;

/// Wait before starting the info harvest once the key exchange concluded.
pub const INFO_REQUEST_DELAY: Duration = Duration::from_secs(1);

/// `0xFE` status byte: peer not in pairing mode.
pub const STATUS_NOT_READY: u8 = 0x08;

/// `0xFE` status byte: key transfer rejected.
pub const STATUS_KEY_REJECTED: u8 = 0x76;

/// Payload of the `0x03` status query.
pub const STATUS_QUERY_PAYLOAD: [u8; 3] = [0x03, 0x00, 0x00];

/// `0x00` activation payload: originator, ACEI, main parameter, three
/// functional parameters. Main parameter `0x00` switches on, `0xc8` off.
pub const ACTIVATE_ON_PAYLOAD: [u8; 6] = [0x01, 0xe7, 0x00, 0x00, 0x00, 0x00];
pub const ACTIVATE_OFF_PAYLOAD: [u8; 6] = [0x01, 0xe7, 0xc8, 0x00, 0x00, 0x00];

/// Single-byte payload of the legacy `0x2E` learning-mode frame.
pub const LEARNING_MODE_PAYLOAD: [u8; 1] = [0x02];
