use std::array::TryFromSliceError;
use std::io;
use thiserror::Error;

/// The primary error type for the `rfgate` library.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("CRC mismatch: computed {computed:04x}, received {received:04x}")]
    CrcMismatch { computed: u16, received: u16 },

    #[error("unknown command byte 0x{0:02x}")]
    UnknownCommand(u8),

    #[error("payload too long: {0} bytes (maximum 21)")]
    PayloadTooLong(usize),

    #[error("radio busy (state {0:?})")]
    RadioBusy(crate::radio::RadioState),

    #[error("no system key configured")]
    SystemKeyMissing,

    #[error("pairing already in progress for {0}")]
    PairingBusy(crate::packet::Address),

    #[error("device {0} not found")]
    DeviceNotFound(crate::packet::Address),

    #[error("device {0} is not paired")]
    NotPaired(crate::packet::Address),

    #[error("invalid address string: {0:?}")]
    InvalidAddress(String),

    #[error("invalid key: expected {expected} hex characters, got {actual}")]
    InvalidKey { expected: usize, actual: usize },

    #[error("peer rejected key transfer (status 0x76)")]
    PeerRejected,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("registry store error: {0}")]
    Store(#[from] serde_json::Error),
}

impl From<TryFromSliceError> for GatewayError {
    fn from(_: TryFromSliceError) -> Self {
        GatewayError::MalformedFrame("failed to convert slice to array".to_string())
    }
}
