use super::{crc, telegram::StartDelimiter, FRAME_OVERHEAD, HEADER_AND_CRC};
use crate::error::FramingError;

/// Check delimiter, length byte and checksum of a complete buffer.
pub fn check(bytes: &[u8]) -> Result<(), FramingError> {
    if bytes.len() < HEADER_AND_CRC {
        return Err(FramingError::TooShort { len: bytes.len() });
    }
    if StartDelimiter::try_from(bytes[0]).is_err() {
        return Err(FramingError::BadDelimiter(bytes[0]));
    }

    let declared = bytes[1] as usize;
    let actual = bytes.len() - FRAME_OVERHEAD;
    if declared != actual {
        return Err(FramingError::LengthMismatch { declared, actual });
    }

    let crc_at = bytes.len() - 2;
    let computed = crc::checksum(&bytes[1..crc_at]);
    let received = u16::from_be_bytes([bytes[crc_at], bytes[crc_at + 1]]);
    if computed != received {
        return Err(FramingError::CrcMismatch { computed, received });
    }
    Ok(())
}

/// True only for a complete, well formed telegram. Never fails loudly.
pub fn validate(bytes: &[u8]) -> bool {
    check(bytes).is_ok()
}

/// Space separated lowercase hex, used for byte dumps in the log.
pub fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
