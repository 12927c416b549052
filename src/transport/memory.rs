use std::sync::{Arc, Mutex};

use super::{Transport, TransportError};

#[derive(Debug, Default)]
struct MemoryState {
    written: Vec<u8>,
    write_calls: usize,
    flushes: usize,
    closed: bool,
}

/// Observer for a [`MemoryTransport`] that stays usable after the transport itself has
/// been boxed into a decorator chain.
#[derive(Debug, Clone, Default)]
pub struct MemoryHandle {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryHandle {
    /// Every byte written so far, in order.
    pub fn written(&self) -> Vec<u8> {
        self.state.lock().unwrap().written.clone()
    }

    /// Number of `write` calls that reached this transport.
    pub fn write_calls(&self) -> usize {
        self.state.lock().unwrap().write_calls
    }

    pub fn flushes(&self) -> usize {
        self.state.lock().unwrap().flushes
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

/// In-memory transport: reads come from a fixed input, writes are recorded.
#[derive(Debug)]
pub struct MemoryTransport {
    input: Vec<u8>,
    cursor: usize,
    read_limit: Option<usize>,
    open: bool,
    handle: MemoryHandle,
}

impl MemoryTransport {
    pub fn new(input: Vec<u8>) -> Self {
        Self {
            input,
            cursor: 0,
            read_limit: None,
            open: true,
            handle: MemoryHandle::default(),
        }
    }

    /// Caps the number of bytes a single `read` returns, to mimic a stream that
    /// delivers data in pieces.
    pub fn with_read_limit(mut self, limit: usize) -> Self {
        self.read_limit = Some(limit.max(1));
        self
    }

    pub fn handle(&self) -> MemoryHandle {
        self.handle.clone()
    }
}

impl Transport for MemoryTransport {
    fn is_open(&self) -> bool {
        self.open
    }

    fn open(&mut self) -> Result<(), TransportError> {
        self.open = true;
        self.handle.state.lock().unwrap().closed = false;
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.open = false;
        self.handle.state.lock().unwrap().closed = true;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        let remaining = &self.input[self.cursor..];
        let mut n = remaining.len().min(buf.len());
        if let Some(limit) = self.read_limit {
            n = n.min(limit);
        }
        buf[..n].copy_from_slice(&remaining[..n]);
        self.cursor += n;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        let mut state = self.handle.state.lock().unwrap();
        state.written.extend_from_slice(buf);
        state.write_calls += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        self.handle.state.lock().unwrap().flushes += 1;
        Ok(())
    }
}
