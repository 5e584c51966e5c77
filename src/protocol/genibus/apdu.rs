use num_enum::FromPrimitive;

use crate::error::{GenibusError, Result};

/// Largest data field an apdu may carry (six bit length).
pub const MAX_APDU_DATA: usize = 63;

/// Task family of an apdu. Decides which operations are legal and how bytes are costed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive)]
#[repr(u8)]
pub enum HeadClass {
    Protocol = 0,
    Measured = 2,
    Command = 3,
    Config = 4,
    Reference = 5,
    Ascii = 7,
    #[num_enum(catch_all)]
    Unknown(u8),
}

impl HeadClass {
    pub fn code(self) -> u8 {
        match self {
            HeadClass::Protocol => 0,
            HeadClass::Measured => 2,
            HeadClass::Command => 3,
            HeadClass::Config => 4,
            HeadClass::Reference => 5,
            HeadClass::Ascii => 7,
            HeadClass::Unknown(code) => code,
        }
    }
}

impl std::fmt::Display for HeadClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Operation specifier carried in the upper two bits of a request apdu header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive)]
#[repr(u8)]
pub enum Operation {
    Get = 0,
    Set = 2,
    Info = 3,
    #[num_enum(catch_all)]
    Unknown(u8),
}

impl Operation {
    pub fn code(self) -> u8 {
        match self {
            Operation::Get => 0,
            Operation::Set => 2,
            Operation::Info => 3,
            Operation::Unknown(code) => code,
        }
    }
}

/// Acknowledge code carried in the same two bits of a response apdu header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive)]
#[repr(u8)]
pub enum AckCode {
    Ok = 0,
    DataClassUnknown = 1,
    ItemUnknown = 2,
    IllegalOperation = 3,
    #[num_enum(catch_all)]
    Unknown(u8),
}

/// One application program data unit: a two byte header followed by up to 63 data bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Apdu {
    pub head_class: HeadClass,
    /// Operation specifier (requests) or acknowledge code (responses), two bits.
    pub os_ack: u8,
    pub data: Vec<u8>,
}

impl Apdu {
    pub fn request(head_class: HeadClass, operation: Operation) -> Self {
        Self {
            head_class,
            os_ack: operation.code() & 0x03,
            data: Vec::new(),
        }
    }

    pub fn operation(&self) -> Operation {
        Operation::from_primitive(self.os_ack)
    }

    pub fn ack(&self) -> AckCode {
        AckCode::from_primitive(self.os_ack)
    }

    pub fn push(&mut self, byte: u8) {
        self.data.push(byte);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Header plus data.
    pub fn encoded_len(&self) -> usize {
        2 + self.data.len()
    }

    /// Only meaningful while the data fits the six bit length field.
    pub fn header(&self) -> [u8; 2] {
        let len = (self.data.len() & 0x3F) as u8;
        [self.head_class.code(), (self.os_ack << 6) | len]
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<()> {
        if self.data.len() > MAX_APDU_DATA {
            return Err(GenibusError::ApduOversize {
                head_class: self.head_class.code(),
                len: self.data.len(),
            });
        }
        out.extend_from_slice(&self.header());
        out.extend_from_slice(&self.data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_packing() {
        let mut apdu = Apdu::request(HeadClass::Config, Operation::Set);
        apdu.push(0x2E);
        apdu.push(0x07);
        assert_eq!(apdu.header(), [0x04, 0x82]);

        let info = Apdu::request(HeadClass::Measured, Operation::Info);
        assert_eq!(info.header(), [0x02, 0xC0]);
    }

    #[test]
    fn test_data_beyond_length_field_is_refused() {
        let mut apdu = Apdu::request(HeadClass::Measured, Operation::Get);
        apdu.data = vec![0x30; MAX_APDU_DATA];
        let mut out = Vec::new();
        assert!(apdu.encode_into(&mut out).is_ok());
        assert_eq!(out.len(), 2 + MAX_APDU_DATA);
        assert_eq!(out[1], 0x3F);

        apdu.push(0x30);
        let mut out = Vec::new();
        assert!(matches!(
            apdu.encode_into(&mut out),
            Err(GenibusError::ApduOversize { head_class: 2, len: 64 })
        ));
        assert!(out.is_empty());
    }

    #[test]
    fn test_unknown_codes_survive() {
        assert_eq!(HeadClass::from_primitive(9), HeadClass::Unknown(9));
        assert_eq!(HeadClass::from_primitive(9).code(), 9);
        assert_eq!(Operation::from_primitive(1), Operation::Unknown(1));
        assert_eq!(AckCode::from_primitive(2), AckCode::ItemUnknown);
    }
}
