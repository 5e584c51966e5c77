use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::{
    apdu::{Apdu, HeadClass},
    crc, frame, FRAME_OVERHEAD,
};
use crate::error::{FramingError, GenibusError, Result};

/// First byte of every telegram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum StartDelimiter {
    Reply = 0x24,
    Message = 0x26,
    Request = 0x27,
}

/// One complete request or response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Telegram {
    pub start_delimiter: StartDelimiter,
    pub destination: u8,
    pub source: u8,
    pub apdus: Vec<Apdu>,
}

impl Telegram {
    /// Empty request. Without apdus it doubles as a connection probe.
    pub fn request(destination: u8, source: u8) -> Self {
        Self {
            start_delimiter: StartDelimiter::Request,
            destination,
            source,
            apdus: Vec::new(),
        }
    }

    pub fn reply(destination: u8, source: u8, apdus: Vec<Apdu>) -> Self {
        Self {
            start_delimiter: StartDelimiter::Reply,
            destination,
            source,
            apdus,
        }
    }

    pub fn is_probe(&self) -> bool {
        self.apdus.is_empty()
    }

    /// Bytes of all apdus including their headers.
    pub fn pdu_len(&self) -> usize {
        self.apdus.iter().map(Apdu::encoded_len).sum()
    }

    /// Value of the length byte: addresses plus pdu.
    pub fn length_field(&self) -> usize {
        self.pdu_len() + 2
    }

    pub fn encoded_len(&self) -> usize {
        self.length_field() + FRAME_OVERHEAD
    }

    pub fn head_classes(&self) -> impl Iterator<Item = HeadClass> + '_ {
        self.apdus.iter().map(|apdu| apdu.head_class)
    }

    pub fn encode(&self) -> Result<Bytes> {
        let length = self.length_field();
        if length > u8::MAX as usize {
            return Err(GenibusError::Oversize {
                len: self.encoded_len(),
            });
        }

        let mut body = Vec::with_capacity(length + 1);
        body.push(length as u8);
        body.push(self.destination);
        body.push(self.source);
        for apdu in &self.apdus {
            apdu.encode_into(&mut body)?;
        }

        let mut out = BytesMut::with_capacity(body.len() + 3);
        out.put_u8(self.start_delimiter.into());
        out.put_slice(&body);
        out.put_slice(&crc::checksum_bytes(&body));
        Ok(out.freeze())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        frame::check(bytes)?;

        let start_delimiter = StartDelimiter::try_from(bytes[0])
            .map_err(|_| FramingError::BadDelimiter(bytes[0]))?;
        let pdu = &bytes[4..bytes.len() - 2];

        let mut apdus = Vec::new();
        let mut idx = 0;
        while idx + 2 <= pdu.len() {
            let len = (pdu[idx + 1] & 0x3F) as usize;
            let end = idx + 2 + len;
            if end > pdu.len() {
                return Err(FramingError::TruncatedApdu { offset: idx + 4 }.into());
            }
            apdus.push(Apdu {
                head_class: HeadClass::from(pdu[idx]),
                os_ack: pdu[idx + 1] >> 6,
                data: pdu[idx + 2..end].to_vec(),
            });
            idx = end;
        }
        if idx != pdu.len() {
            return Err(FramingError::TruncatedApdu { offset: idx + 4 }.into());
        }

        Ok(Self {
            start_delimiter,
            destination: bytes[2],
            source: bytes[3],
            apdus,
        })
    }
}
