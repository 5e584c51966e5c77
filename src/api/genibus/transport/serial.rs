//! Serial port byte stream

use serialport::SerialPort;
use std::{
    io::{Read, Write},
    time::Duration,
};

use super::{ByteStream, Connector};
use crate::{api::utils::open_serial_port, error::Result};

/// How long one read blocks when nothing arrives.
const READ_POLL: Duration = Duration::from_millis(5);

pub struct SerialStream {
    port: Box<dyn SerialPort>,
}

impl ByteStream for SerialStream {
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        match self.port.read(buffer) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        Ok(self.port.write(data)?)
    }

    fn flush(&mut self) -> Result<()> {
        self.port.flush()?;
        Ok(())
    }

    fn available(&mut self) -> Result<usize> {
        Ok(self.port.bytes_to_read()? as usize)
    }
}

/// Opens the named port at the configured baud rate, 8N1.
pub struct SerialConnector {
    port_name: String,
    baud_rate: u32,
}

impl SerialConnector {
    pub fn new(port_name: &str, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.to_string(),
            baud_rate,
        }
    }
}

impl Connector for SerialConnector {
    fn open(&mut self) -> Result<Box<dyn ByteStream>> {
        let port = open_serial_port(&self.port_name, self.baud_rate, READ_POLL)?;
        log::debug!("Opened serial port: {} at {} baud", self.port_name, self.baud_rate);
        Ok(Box::new(SerialStream { port }))
    }

    fn port_name(&self) -> &str {
        &self.port_name
    }
}
