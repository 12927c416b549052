//! Byte-stream transports.
//!
//! A [`Transport`] is a duplex byte stream with an explicit open/closed lifecycle. It
//! knows nothing about message framing or value encoding; that is the job of a
//! [`Protocol`](crate::protocol::Protocol) layered on top.
//!
//! # Decorators
//!
//! Transports compose by wrapping. Each decorator exclusively owns the transport it
//! wraps as a `Box<dyn Transport>`, so a chain such as
//! `BufferedTransport -> RouterTransport -> SocketTransport` is destroyed front to back
//! when the outermost value is dropped. Callers only ever see the chain as a
//! `dyn Transport`.
//!
//! - [`BufferedTransport`]: coalesces small reads and writes.
//! - [`RouterTransport`]: tees every byte passing through into a shared
//!   [`LogWriter`](crate::storage::LogWriter).
//!
//! # Servers
//!
//! A [`ServerTransport`] listens for connections and hands each accepted stream out as
//! a [`Duplex`]: an input half and an output half over the same peer. Each half is
//! decorated separately by a [`TransportFactory`].
mod buffered;
mod memory;
mod router;
mod socket;

use std::{io, net::SocketAddr, sync::Arc};

use thiserror::Error;

pub use buffered::{BufferedTransport, BufferedTransportFactory, DEFAULT_BUFFER_SIZE};
pub use memory::{MemoryHandle, MemoryTransport};
pub use router::{RouterTransport, RouterTransportFactory};
pub use socket::{ServerSocket, ServerSocketHandle, SocketTransport};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(#[source] io::Error),
    #[error("transport IO error: {0}")]
    Io(#[from] io::Error),
    #[error("transport is not open")]
    NotOpen,
    #[error("peer closed the stream before the read completed")]
    EndOfStream,
    #[error("listener was interrupted")]
    Interrupted,
}

/// Duplex byte stream.
pub trait Transport: Send {
    fn is_open(&self) -> bool;

    /// Establishes the underlying resource. Opening an already open transport is a no-op.
    fn open(&mut self) -> Result<(), TransportError>;

    /// Releases the underlying resource. Safe to call more than once.
    fn close(&mut self) -> Result<(), TransportError>;

    /// Reads up to `buf.len()` bytes. `Ok(0)` means the peer ended the stream.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Writes every byte of `buf` or fails.
    fn write(&mut self, buf: &[u8]) -> Result<(), TransportError>;

    fn flush(&mut self) -> Result<(), TransportError>;

    /// Fills `buf` completely, failing with [`TransportError::EndOfStream`] if the peer
    /// closes first.
    fn read_all(&mut self, mut buf: &mut [u8]) -> Result<(), TransportError> {
        while !buf.is_empty() {
            match self.read(buf)? {
                0 => return Err(TransportError::EndOfStream),
                n => buf = &mut buf[n..],
            }
        }
        Ok(())
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn open(&mut self) -> Result<(), TransportError> {
        (**self).open()
    }

    fn close(&mut self) -> Result<(), TransportError> {
        (**self).close()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        (**self).write(buf)
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        (**self).flush()
    }
}

/// Input and output halves of one connection.
pub struct Duplex {
    pub input: Box<dyn Transport>,
    pub output: Box<dyn Transport>,
}

impl Duplex {
    pub fn new(input: Box<dyn Transport>, output: Box<dyn Transport>) -> Self {
        Self { input, output }
    }

    /// Wraps both halves with `factory`.
    pub fn decorate(self, factory: &dyn TransportFactory) -> Self {
        Self {
            input: factory.transport(self.input),
            output: factory.transport(self.output),
        }
    }
}

/// Listening endpoint that yields one [`Duplex`] per accepted connection.
pub trait ServerTransport: Send {
    fn listen(&mut self) -> Result<(), TransportError>;

    /// Blocks until a peer connects.
    fn accept(&mut self) -> Result<Duplex, TransportError>;

    fn close(&mut self) -> Result<(), TransportError>;

    /// Bound address, once listening.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Handle that makes a pending or future `accept` fail with
    /// [`TransportError::Interrupted`]. Usable from any thread.
    fn interrupter(&self) -> Arc<dyn Interrupt>;
}

pub trait Interrupt: Send + Sync {
    fn interrupt(&self);
}

/// Builds the per-connection decorator chain around a raw transport.
pub trait TransportFactory: Send + Sync {
    fn transport(&self, inner: Box<dyn Transport>) -> Box<dyn Transport>;
}

/// Hands transports back undecorated.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughTransportFactory;

impl TransportFactory for PassthroughTransportFactory {
    fn transport(&self, inner: Box<dyn Transport>) -> Box<dyn Transport> {
        inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_all_reports_short_stream() {
        let mut transport = MemoryTransport::new(b"abc".to_vec());
        let mut buf = [0u8; 5];

        let err = transport.read_all(&mut buf).unwrap_err();
        assert!(matches!(err, TransportError::EndOfStream));
    }

    #[test]
    fn read_all_fills_buffer_across_reads() {
        let mut transport = MemoryTransport::new(b"hello world".to_vec()).with_read_limit(3);
        let mut buf = [0u8; 11];

        transport.read_all(&mut buf).unwrap();
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn passthrough_keeps_transport() {
        let inner = MemoryTransport::new(Vec::new());
        let handle = inner.handle();
        let mut transport = PassthroughTransportFactory.transport(Box::new(inner));

        transport.write(b"xyz").unwrap();
        assert_eq!(handle.written(), b"xyz");
    }
}
