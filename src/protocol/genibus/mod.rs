//! GENIbus wire level: checksum, APDU packing, telegram framing and the unit table.
//!
//! Everything here is stateless. The engine in [`crate::api::genibus`] builds on these pieces.

pub mod apdu;
pub mod crc;
pub mod frame;
pub mod telegram;
pub mod units;

pub use apdu::{AckCode, Apdu, HeadClass, Operation, MAX_APDU_DATA};
pub use frame::{hex, validate};
pub use telegram::{StartDelimiter, Telegram};
pub use units::{lookup_unit, Quantity, Unit};

/// Destination address that every device on the bus listens to.
pub const BROADCAST_ADDRESS: u8 = 254;

/// Bus address the bridge uses as the source of its requests.
pub const DEFAULT_SOURCE_ADDRESS: u8 = 0x01;

/// Start delimiter, length, crc high and crc low.
pub const FRAME_OVERHEAD: usize = 4;

/// Frame overhead plus the two address bytes.
pub const HEADER_AND_CRC: usize = 6;

/// Data cap of an INFO apdu.
pub const INFO_APDU_CAP: usize = 15;

/// Data cap of an ASCII apdu.
pub const ASCII_APDU_CAP: usize = 65;
