use std::{
    io::{self, Read, Write},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use log::{debug, info, warn};

use super::{Duplex, Interrupt, ServerTransport, Transport, TransportError};

/// TCP stream transport, either connected lazily from an address or wrapping an
/// accepted stream.
#[derive(Debug)]
pub struct SocketTransport {
    addr: Option<SocketAddr>,
    stream: Option<TcpStream>,
}

impl SocketTransport {
    /// Unopened client transport; [`open`](Transport::open) connects to `addr`.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr: Some(addr),
            stream: None,
        }
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        Self {
            addr: stream.peer_addr().ok(),
            stream: Some(stream),
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    /// Splits an open socket into input and output halves over the same OS socket.
    /// Closing either half shuts the whole socket down.
    pub fn split(self) -> Result<Duplex, TransportError> {
        let stream = self.stream.as_ref().ok_or(TransportError::NotOpen)?;
        let output = Self {
            addr: self.addr,
            stream: Some(stream.try_clone()?),
        };
        Ok(Duplex::new(Box::new(self), Box::new(output)))
    }

    fn stream(&mut self) -> Result<&mut TcpStream, TransportError> {
        self.stream.as_mut().ok_or(TransportError::NotOpen)
    }
}

impl Transport for SocketTransport {
    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn open(&mut self) -> Result<(), TransportError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let addr = self.addr.ok_or_else(|| {
            TransportError::Connection(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no address to connect to",
            ))
        })?;
        let stream = TcpStream::connect(addr).map_err(TransportError::Connection)?;
        stream.set_nodelay(true).map_err(TransportError::Connection)?;
        self.stream = Some(stream);
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        let Some(stream) = self.stream.take() else {
            return Ok(());
        };
        match stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let stream = self.stream()?;
        loop {
            match stream.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        self.stream()?.write_all(buf)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        self.stream()?.flush()?;
        Ok(())
    }
}

/// Wakes a [`ServerSocket`] blocked in `accept`.
#[derive(Debug, Clone)]
pub struct ServerSocketHandle {
    interrupted: Arc<AtomicBool>,
    local_addr: Arc<Mutex<Option<SocketAddr>>>,
}

impl Interrupt for ServerSocketHandle {
    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);

        // A throwaway connection unblocks a pending accept.
        let bound = *self.local_addr.lock().unwrap();
        if let Some(mut addr) = bound {
            if addr.ip().is_unspecified() {
                addr.set_ip(match addr.ip() {
                    IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                    IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
                });
            }
            if let Err(e) = TcpStream::connect(addr) {
                debug!("listener wake-up connection failed: {e}");
            }
        }
    }
}

/// TCP listener handing out one [`Duplex`] per accepted connection.
#[derive(Debug)]
pub struct ServerSocket {
    addr: SocketAddr,
    listener: Option<TcpListener>,
    handle: ServerSocketHandle,
}

impl ServerSocket {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            listener: None,
            handle: ServerSocketHandle {
                interrupted: Arc::new(AtomicBool::new(false)),
                local_addr: Arc::new(Mutex::new(None)),
            },
        }
    }

    /// Listens on `port` on every interface.
    pub fn on_port(port: u16) -> Self {
        Self::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
    }

    pub fn handle(&self) -> ServerSocketHandle {
        self.handle.clone()
    }

    fn is_interrupted(&self) -> bool {
        self.handle.interrupted.load(Ordering::SeqCst)
    }
}

impl ServerTransport for ServerSocket {
    /// Binds the listener. Binding again after [`close`](ServerTransport::close) clears
    /// an earlier interrupt.
    fn listen(&mut self) -> Result<(), TransportError> {
        if self.listener.is_some() {
            return Ok(());
        }
        let listener = TcpListener::bind(self.addr).map_err(TransportError::Connection)?;
        let local = listener.local_addr().map_err(TransportError::Connection)?;
        *self.handle.local_addr.lock().unwrap() = Some(local);
        self.handle.interrupted.store(false, Ordering::SeqCst);
        info!("listening at {local}");
        self.listener = Some(listener);
        Ok(())
    }

    fn accept(&mut self) -> Result<Duplex, TransportError> {
        if self.is_interrupted() {
            return Err(TransportError::Interrupted);
        }
        let listener = self.listener.as_ref().ok_or(TransportError::NotOpen)?;

        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if self.is_interrupted() {
                        return Err(TransportError::Interrupted);
                    }
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("failed to set TCP_NODELAY for {peer}: {e}");
                    }
                    debug!("accepted connection from {peer}");
                    return SocketTransport::from_stream(stream).split();
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransportError::Connection(e)),
            }
        }
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if self.listener.take().is_some() {
            *self.handle.local_addr.lock().unwrap() = None;
            info!("listener at {} closed", self.addr);
        }
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref()?.local_addr().ok()
    }

    fn interrupter(&self) -> Arc<dyn Interrupt> {
        Arc::new(self.handle())
    }
}
