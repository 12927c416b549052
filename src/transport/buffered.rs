use log::debug;

use super::{Transport, TransportError, TransportFactory};

pub const DEFAULT_BUFFER_SIZE: usize = 512;

/// Decorator that coalesces small reads and writes against its inner transport.
///
/// Writes that fit in the write buffer never reach the inner transport until the buffer
/// overflows, [`flush`](Transport::flush) is called, or the transport is closed or
/// dropped. Reads are served from a read buffer refilled with one inner `read` at a
/// time; reads at least as large as the buffer go straight to the inner transport.
pub struct BufferedTransport {
    inner: Box<dyn Transport>,
    capacity: usize,
    rbuf: Box<[u8]>,
    rpos: usize,
    rlen: usize,
    wbuf: Vec<u8>,
}

impl BufferedTransport {
    pub fn new(inner: Box<dyn Transport>) -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE, inner)
    }

    pub fn with_capacity(capacity: usize, inner: Box<dyn Transport>) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner,
            capacity,
            rbuf: Box::default(),
            rpos: 0,
            rlen: 0,
            wbuf: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Moves pending write bytes to the inner transport without flushing it.
    fn drain_write_buffer(&mut self) -> Result<(), TransportError> {
        if self.wbuf.is_empty() {
            return Ok(());
        }
        let res = self.inner.write(&self.wbuf);
        self.wbuf.clear();
        res
    }

    fn release_buffers(&mut self) {
        self.rbuf = Box::default();
        self.rpos = 0;
        self.rlen = 0;
        self.wbuf = Vec::new();
    }
}

impl Transport for BufferedTransport {
    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn open(&mut self) -> Result<(), TransportError> {
        self.inner.open()
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if !self.inner.is_open() {
            self.release_buffers();
            return Ok(());
        }
        let drained = self.drain_write_buffer();
        let flushed = drained.and_then(|_| self.inner.flush());
        self.release_buffers();
        let closed = self.inner.close();
        flushed.and(closed)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        if self.rpos == self.rlen {
            if buf.len() >= self.capacity {
                return self.inner.read(buf);
            }
            if self.rbuf.is_empty() {
                self.rbuf = vec![0; self.capacity].into_boxed_slice();
            }
            self.rpos = 0;
            self.rlen = self.inner.read(&mut self.rbuf)?;
            if self.rlen == 0 {
                return Ok(0);
            }
        }

        let n = buf.len().min(self.rlen - self.rpos);
        buf[..n].copy_from_slice(&self.rbuf[self.rpos..self.rpos + n]);
        self.rpos += n;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        if self.wbuf.len() + buf.len() <= self.capacity {
            self.wbuf.extend_from_slice(buf);
            return Ok(());
        }

        self.drain_write_buffer()?;
        if buf.len() >= self.capacity {
            self.inner.write(buf)
        } else {
            self.wbuf.extend_from_slice(buf);
            Ok(())
        }
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        self.drain_write_buffer()?;
        self.inner.flush()
    }
}

impl Drop for BufferedTransport {
    fn drop(&mut self) {
        let pending = self.wbuf.len();
        if self.is_open() && pending > 0 {
            if let Err(e) = self.flush() {
                debug!("lost {pending} buffered bytes on drop: {e}");
            }
        }
    }
}

/// Wraps every transport in a [`BufferedTransport`] of the configured capacity.
#[derive(Debug, Clone, Copy)]
pub struct BufferedTransportFactory {
    capacity: usize,
}

impl BufferedTransportFactory {
    pub fn new(capacity: usize) -> Self {
        Self { capacity }
    }
}

impl Default for BufferedTransportFactory {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

impl TransportFactory for BufferedTransportFactory {
    fn transport(&self, inner: Box<dyn Transport>) -> Box<dyn Transport> {
        Box::new(BufferedTransport::with_capacity(self.capacity, inner))
    }
}
