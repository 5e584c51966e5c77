//! Transport adapter: owns the byte stream, sends one request and waits for one framed response.

pub mod mock;
pub mod serial;

use std::{
    thread,
    time::{Duration, Instant},
};

use super::CycleTuning;
use crate::{
    error::{GenibusError, Result},
    protocol::genibus::{frame, Telegram},
};

/// Longest telegram the one-byte length field allows.
const MAX_TELEGRAM_LEN: usize = u8::MAX as usize + 4;

/// Raw half-duplex byte stream (a serial port, or a mock in tests).
pub trait ByteStream: Send {
    /// Read what arrived, returns 0 when nothing arrived within the stream's poll interval
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize>;

    /// Write data from buffer, returns number of bytes written
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Flush any pending writes (blocking until complete)
    fn flush(&mut self) -> Result<()>;

    /// Bytes waiting to be read
    fn available(&mut self) -> Result<usize> {
        Ok(0)
    }
}

/// Opens byte streams. Reopening after a link failure goes through here.
pub trait Connector: Send {
    fn open(&mut self) -> Result<Box<dyn ByteStream>>;

    fn port_name(&self) -> &str;
}

pub struct TransportAdapter {
    connector: Box<dyn Connector>,
    stream: Option<Box<dyn ByteStream>>,
    drain_timeout: Duration,
    settle_delay: Duration,
}

impl TransportAdapter {
    pub fn new(connector: Box<dyn Connector>, tuning: &CycleTuning) -> Self {
        Self {
            connector,
            stream: None,
            drain_timeout: Duration::from_millis(tuning.drain_timeout_ms),
            settle_delay: Duration::from_millis(tuning.settle_delay_ms),
        }
    }

    pub fn port_name(&self) -> &str {
        self.connector.port_name()
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    pub fn open(&mut self) -> Result<()> {
        if self.stream.is_none() {
            self.stream = Some(self.connector.open()?);
            log::info!("Opened GENIbus port {}", self.connector.port_name());
        }
        Ok(())
    }

    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            log::info!("Closed GENIbus port {}", self.connector.port_name());
        }
    }

    /// Write a single no-op byte. On failure the port is closed and reopened, and the failure is
    /// returned so the caller can treat every device as lost.
    pub fn check_link(&mut self) -> Result<()> {
        let result = match self.stream.as_mut() {
            Some(stream) => write_all(stream.as_mut(), &[0x00]).and_then(|_| stream.flush()),
            None => Err(GenibusError::NotConnected),
        };
        if let Err(err) = result {
            log::warn!("Link check on {} failed: {}", self.port_name(), err);
            self.close();
            if let Err(reopen) = self.open() {
                log::warn!("Reopening {} failed: {}", self.port_name(), reopen);
            }
            return Err(err);
        }
        Ok(())
    }

    /// Send one telegram and wait for its response.
    ///
    /// `Ok(None)` means no valid response arrived within `timeout`, either before the first byte or
    /// while the rest of the frame was coming in. Errors are reserved for the stream itself
    /// failing.
    pub fn send_and_wait(
        &mut self,
        telegram: &Telegram,
        timeout: Duration,
    ) -> Result<Option<Telegram>> {
        let encoded = telegram.encode()?;
        let stream = self.stream.as_mut().ok_or(GenibusError::NotConnected)?;

        drain(stream.as_mut(), self.drain_timeout)?;
        log::trace!("-> {}", frame::hex(&encoded));
        write_all(stream.as_mut(), &encoded)?;
        stream.flush()?;

        let mut buffer = Vec::with_capacity(64);
        let mut chunk = [0u8; 256];

        let waiting = Instant::now();
        loop {
            let n = stream.read(&mut chunk)?;
            if n > 0 {
                buffer.extend_from_slice(&chunk[..n]);
                break;
            }
            if waiting.elapsed() >= timeout {
                log::debug!(
                    "No answer to telegram for address {} within {} ms",
                    telegram.destination,
                    timeout.as_millis()
                );
                return Ok(None);
            }
        }

        let receiving = Instant::now();
        while !frame::validate(&buffer) {
            if receiving.elapsed() >= timeout || buffer.len() > MAX_TELEGRAM_LEN {
                log::warn!("Discarding invalid response: {}", frame::hex(&buffer));
                return Ok(None);
            }
            let n = stream.read(&mut chunk)?;
            buffer.extend_from_slice(&chunk[..n]);
        }
        log::trace!("<- {}", frame::hex(&buffer));

        thread::sleep(self.settle_delay);

        match Telegram::decode(&buffer) {
            Ok(response) => Ok(Some(response)),
            Err(err) => {
                log::warn!("Discarding response {}: {}", frame::hex(&buffer), err);
                Ok(None)
            }
        }
    }
}

fn write_all(stream: &mut dyn ByteStream, mut data: &[u8]) -> Result<()> {
    while !data.is_empty() {
        let n = stream.write(data)?;
        if n == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into());
        }
        data = &data[n..];
    }
    Ok(())
}

/// Throw away whatever is still buffered from earlier traffic.
fn drain(stream: &mut dyn ByteStream, timeout: Duration) -> Result<()> {
    let started = Instant::now();
    let mut chunk = [0u8; 256];
    let mut drained = 0;
    loop {
        let pending = stream.available()?;
        if pending == 0 {
            break;
        }
        if started.elapsed() >= timeout {
            return Err(GenibusError::Overflow { pending });
        }
        drained += stream.read(&mut chunk)?;
    }
    if drained > 0 {
        log::warn!("Drained {} stale bytes before sending", drained);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        mock::{MockConnector, MockStream},
        *,
    };
    use crate::protocol::genibus::{Apdu, HeadClass};

    fn adapter(stream: &MockStream) -> Result<TransportAdapter> {
        let mut adapter = TransportAdapter::new(
            Box::new(MockConnector::new(stream.clone())),
            &CycleTuning::default(),
        );
        adapter.open()?;
        Ok(adapter)
    }

    #[test]
    fn test_round_trip() -> Result<()> {
        let stream = MockStream::with_responder(|request| {
            assert_eq!(request, [0x27, 0x02, 0xC8, 0x01, 0xD2, 0xDF]);
            Some(vec![0x24, 0x02, 0x01, 0xC8, 0x36, 0x76])
        });
        let mut adapter = adapter(&stream)?;
        let response = adapter
            .send_and_wait(&Telegram::request(0xC8, 0x01), Duration::from_millis(50))?
            .unwrap();
        assert_eq!(response.source, 0xC8);
        assert!(response.apdus.is_empty());
        Ok(())
    }

    #[test]
    fn test_timeout_and_garbage_yield_none() -> Result<()> {
        let silent = MockStream::new();
        let mut adapter_silent = adapter(&silent)?;
        let started = Instant::now();
        let response = adapter_silent
            .send_and_wait(&Telegram::request(0x20, 0x01), Duration::from_millis(20))?;
        assert!(response.is_none());
        assert!(started.elapsed() >= Duration::from_millis(20));

        let noisy = MockStream::with_responder(|_| Some(vec![0x24, 0x02, 0x01, 0x20, 0x00, 0x00]));
        let mut adapter_noisy = adapter(&noisy)?;
        let response =
            adapter_noisy.send_and_wait(&Telegram::request(0x20, 0x01), Duration::from_millis(20))?;
        assert!(response.is_none());
        Ok(())
    }

    #[test]
    fn test_stale_input_is_drained() -> Result<()> {
        let stream = MockStream::with_responder(|_| Some(vec![0x24, 0x02, 0x01, 0xC8, 0x36, 0x76]));
        stream.inject_read(&[0xAA, 0xBB, 0xCC]);
        let mut adapter = adapter(&stream)?;
        let response =
            adapter.send_and_wait(&Telegram::request(0xC8, 0x01), Duration::from_millis(50))?;
        assert!(response.is_some());
        Ok(())
    }

    #[test]
    fn test_response_split_across_reads() -> Result<()> {
        let mut apdu = Apdu::request(HeadClass::Measured, crate::protocol::genibus::Operation::Get);
        apdu.push(0x10);
        let reply = Telegram::reply(0x01, 0x20, vec![apdu]).encode()?.to_vec();
        let stream = MockStream::with_responder(move |_| Some(reply.clone()));
        stream.set_chunk_size(2);
        let mut adapter = adapter(&stream)?;
        let response = adapter
            .send_and_wait(&Telegram::request(0x20, 0x01), Duration::from_millis(50))?
            .unwrap();
        assert_eq!(response.apdus[0].data, vec![0x10]);
        Ok(())
    }

    #[test]
    fn test_link_check_reopens() -> Result<()> {
        let stream = MockStream::new();
        let mut adapter = adapter(&stream)?;
        adapter.check_link()?;
        assert_eq!(stream.written(), vec![vec![0x00]]);

        stream.set_fail_writes(true);
        assert!(adapter.check_link().is_err());
        assert!(adapter.is_open());
        assert_eq!(stream.open_count(), 2);
        Ok(())
    }

    #[test]
    fn test_endless_input_aborts_before_sending() -> Result<()> {
        let stream = MockStream::with_responder(|_| Some(vec![0x24, 0x02, 0x01, 0xC8, 0x36, 0x76]));
        stream.set_babbling(true);
        let mut adapter = adapter(&stream)?;
        let started = Instant::now();
        assert!(matches!(
            adapter.send_and_wait(&Telegram::request(0xC8, 0x01), Duration::from_millis(50)),
            Err(GenibusError::Overflow { pending }) if pending > 0
        ));
        let drain_timeout = Duration::from_millis(CycleTuning::default().drain_timeout_ms);
        assert!(started.elapsed() >= drain_timeout);
        assert!(stream.written().is_empty());
        Ok(())
    }

    #[test]
    fn test_not_connected() {
        let mut adapter = TransportAdapter::new(
            Box::new(MockConnector::new(MockStream::new())),
            &CycleTuning::default(),
        );
        assert!(matches!(
            adapter.send_and_wait(&Telegram::request(0x20, 0x01), Duration::from_millis(5)),
            Err(GenibusError::NotConnected)
        ));
    }
}
