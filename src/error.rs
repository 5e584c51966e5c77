//! Error taxonomy of the GENIbus engine.
//!
//! None of these errors are fatal to the cycle loop. The orchestrator logs them and folds them into
//! device state (retry later, or reset the device).

use thiserror::Error;

use crate::protocol::genibus::apdu::{AckCode, HeadClass};

pub type Result<T, E = GenibusError> = std::result::Result<T, E>;

/// Why a byte buffer is not a complete telegram.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("buffer too short ({len} bytes)")]
    TooShort { len: usize },
    #[error("bad start delimiter 0x{0:02x}")]
    BadDelimiter(u8),
    #[error("length byte says {declared}, buffer carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("crc mismatch: computed 0x{computed:04x}, received 0x{received:04x}")]
    CrcMismatch { computed: u16, received: u16 },
    #[error("apdu at offset {offset} runs past the end of the pdu")]
    TruncatedApdu { offset: usize },
}

/// A response that does not belong to the request that provoked it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Mismatch {
    #[error("request went to address {expected}, response came from {found}")]
    Address { expected: u8, found: u8 },
    #[error("request carried {expected} apdus, response carries {found}")]
    ApduCount { expected: usize, found: usize },
    #[error("apdu {index}: request head class {expected}, response head class {found}")]
    HeadClass { index: usize, expected: u8, found: u8 },
}

#[derive(Debug, Error)]
pub enum GenibusError {
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("no valid response within {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(#[from] Mismatch),

    #[error("apdu for head class {head_class:?} answered with {ack:?}")]
    PartialApdu { head_class: HeadClass, ack: AckCode },

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("input buffer still holds {pending} bytes after draining, refusing to send")]
    Overflow { pending: usize },

    #[error("port is not open")]
    NotConnected,

    #[error("telegram of {len} bytes does not fit the length field")]
    Oversize { len: usize },

    #[error("apdu for head class {head_class} carries {len} data bytes, at most 63 fit")]
    ApduOversize { head_class: u8, len: usize },

    #[error("unsupported head class {0}")]
    UnsupportedHeadClass(u8),

    #[error("task {head_class}/{address}: data width {width} is not 1 to 4 bytes")]
    UnsupportedWidth { head_class: u8, address: u8, width: u8 },

    #[error("task {head_class}/{address} cannot be written")]
    ReadOnly { head_class: u8, address: u8 },

    #[error("no device registered with id {0}")]
    UnknownDevice(String),

    #[error("device {device_id} has no task {head_class}/{address}")]
    UnknownTask {
        device_id: String,
        head_class: u8,
        address: u8,
    },

    #[error("a device with id {0} is already registered")]
    DuplicateDevice(String),
}
