use serialport::{DataBits, FlowControl, Parity, SerialPort, SerialPortBuilder, StopBits};
use std::time::Duration;

use crate::error::Result;

/// Open a serial port 8N1 with the requested read timeout, enabling exclusive access on Unix
/// systems.
pub fn open_serial_port(
    port: &str,
    baud_rate: u32,
    timeout: Duration,
) -> Result<Box<dyn SerialPort>> {
    let builder = serialport::new(port, baud_rate)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .timeout(timeout);
    open_builder(builder)
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        fn open_builder(builder: SerialPortBuilder) -> Result<Box<dyn SerialPort>> {
            let mut handle = builder.open_native()?;
            handle.set_exclusive(true)?;
            Ok(Box::new(handle))
        }
    } else {
        fn open_builder(builder: SerialPortBuilder) -> Result<Box<dyn SerialPort>> {
            Ok(builder.open()?)
        }
    }
}
