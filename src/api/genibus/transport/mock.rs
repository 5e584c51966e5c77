//! In-memory byte stream for tests and simulations

use parking_lot::Mutex;
use std::{collections::VecDeque, sync::Arc, thread, time::Duration};

use super::{ByteStream, Connector};
use crate::{
    error::{GenibusError, Result},
    protocol::genibus::frame,
};

/// Plays the device: gets every complete request frame, returns the bytes to answer with (if any).
pub type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

/// Shared mock stream. Clones see the same buffers, so a test keeps one handle while the bridge
/// owns another.
#[derive(Clone)]
pub struct MockStream {
    inner: Arc<Mutex<MockStreamInner>>,
}

struct MockStreamInner {
    read_buffer: VecDeque<u8>,
    written: Vec<Vec<u8>>,
    responder: Option<Responder>,
    chunk_size: usize,
    fail_writes: bool,
    fail_open: bool,
    babbling: bool,
    opens: usize,
}

impl Default for MockStream {
    fn default() -> Self {
        Self::new()
    }
}

impl MockStream {
    /// A stream nobody answers on.
    pub fn new() -> Self {
        MockStream {
            inner: Arc::new(Mutex::new(MockStreamInner {
                read_buffer: VecDeque::new(),
                written: Vec::new(),
                responder: None,
                chunk_size: usize::MAX,
                fail_writes: false,
                fail_open: false,
                babbling: false,
                opens: 0,
            })),
        }
    }

    pub fn with_responder<F>(responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        let stream = Self::new();
        stream.inner.lock().responder = Some(Box::new(responder));
        stream
    }

    /// Inject data to be read
    pub fn inject_read(&self, data: &[u8]) {
        self.inner.lock().read_buffer.extend(data);
    }

    /// Every write call so far, in order
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.inner.lock().written.clone()
    }

    /// Written buffers that form a valid telegram
    pub fn written_frames(&self) -> Vec<Vec<u8>> {
        self.inner
            .lock()
            .written
            .iter()
            .filter(|data| frame::validate(data))
            .cloned()
            .collect()
    }

    pub fn clear_written(&self) {
        self.inner.lock().written.clear();
    }

    /// Hand out at most `size` bytes per read, to exercise reassembly.
    pub fn set_chunk_size(&self, size: usize) {
        self.inner.lock().chunk_size = size.max(1);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.lock().fail_writes = fail;
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.inner.lock().fail_open = fail;
    }

    /// Noise on the line: reads never run dry.
    pub fn set_babbling(&self, babbling: bool) {
        self.inner.lock().babbling = babbling;
    }

    pub fn open_count(&self) -> usize {
        self.inner.lock().opens
    }
}

impl ByteStream for MockStream {
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        if inner.babbling {
            let count = buffer.len().min(inner.chunk_size);
            buffer[..count].fill(0x55);
            return Ok(count);
        }
        if inner.read_buffer.is_empty() {
            drop(inner);
            // stands in for the poll interval of a real port
            thread::sleep(Duration::from_millis(1));
            return Ok(0);
        }

        let count = inner
            .read_buffer
            .len()
            .min(buffer.len())
            .min(inner.chunk_size);
        for (slot, byte) in buffer.iter_mut().zip(inner.read_buffer.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        if inner.fail_writes {
            return Err(
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "mock write failure").into(),
            );
        }
        inner.written.push(data.to_vec());

        if frame::validate(data) {
            let answer = inner.responder.as_mut().and_then(|responder| responder(data));
            if let Some(answer) = answer {
                inner.read_buffer.extend(answer);
            }
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn available(&mut self) -> Result<usize> {
        let inner = self.inner.lock();
        if inner.babbling {
            return Ok(inner.chunk_size.min(256));
        }
        Ok(inner.read_buffer.len())
    }
}

/// Connector that hands out clones of one [`MockStream`].
pub struct MockConnector {
    stream: MockStream,
    name: String,
}

impl MockConnector {
    pub fn new(stream: MockStream) -> Self {
        Self {
            stream,
            name: "mock".to_string(),
        }
    }
}

impl Connector for MockConnector {
    fn open(&mut self) -> Result<Box<dyn ByteStream>> {
        let mut inner = self.stream.inner.lock();
        if inner.fail_open {
            return Err(GenibusError::Transport(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "mock port unavailable",
            )));
        }
        inner.opens += 1;
        drop(inner);
        Ok(Box::new(self.stream.clone()))
    }

    fn port_name(&self) -> &str {
        &self.name
    }
}
