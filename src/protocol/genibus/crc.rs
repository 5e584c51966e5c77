use crc::{Crc, CRC_16_GENIBUS};

/// CCITT polynomial 0x1021, initial value 0xFFFF, output inverted.
pub const GENIBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_GENIBUS);

/// Checksum over the length byte, the addresses and the pdu (everything between the start delimiter
/// and the two trailing crc bytes).
pub fn checksum(bytes: &[u8]) -> u16 {
    GENIBUS_CRC.checksum(bytes)
}

/// Checksum as it goes on the wire, high byte first.
pub fn checksum_bytes(bytes: &[u8]) -> [u8; 2] {
    checksum(bytes).to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_value() {
        assert_eq!(checksum(b"123456789"), 0xD64E);
    }

    #[test]
    fn test_empty_request_crc() {
        // 27 02 c8 01 | d2 df
        assert_eq!(checksum_bytes(&[0x02, 0xC8, 0x01]), [0xD2, 0xDF]);
        // 24 04 c8 00 00 00 | 51 92
        assert_eq!(checksum_bytes(&[0x04, 0xC8, 0x00, 0x00, 0x00]), [0x51, 0x92]);
    }
}
