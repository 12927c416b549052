//! Servers that accept connections and drive a [`Processor`] over each of them.
//!
//! Both flavours share one accept loop and differ only in [`Dispatch`]: the simple
//! server serves each connection on the accepting thread, the pooled server hands each
//! connection to a [`ThreadManager`] and goes straight back to accepting.
use std::{
    net::SocketAddr,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::{
    concurrency::{ConcurrencyError, ThreadManager},
    processor::Processor,
    protocol::{BinaryProtocolFactory, Protocol, ProtocolFactory},
    storage::LogError,
    transport::{
        Duplex, Interrupt, PassthroughTransportFactory, ServerTransport, TransportError,
        TransportFactory,
    },
};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),
    #[error("request log unavailable: {0}")]
    Log(#[from] LogError),
}

/// Where accepted connections are served.
pub enum Dispatch {
    /// On the accepting thread, one connection at a time.
    Inline,
    /// On a started worker pool.
    Pool(Arc<ThreadManager>),
}

pub struct Server {
    listener: Box<dyn ServerTransport>,
    transport_factory: Arc<dyn TransportFactory>,
    protocol_factory: Arc<dyn ProtocolFactory>,
    processor: Arc<dyn Processor>,
    dispatch: Dispatch,
    interrupted: Arc<AtomicBool>,
}

/// Wakes the listener and any acceptor waiting for pool queue space.
struct ServerInterrupt {
    listener: Arc<dyn Interrupt>,
    interrupted: Arc<AtomicBool>,
    pool: Option<Weak<ThreadManager>>,
}

impl Interrupt for ServerInterrupt {
    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.listener.interrupt();
        if let Some(pool) = self.pool.as_ref().and_then(Weak::upgrade) {
            pool.wake_producers();
        }
    }
}

impl Server {
    pub fn new(
        listener: impl ServerTransport + 'static,
        processor: Arc<dyn Processor>,
        dispatch: Dispatch,
    ) -> Self {
        Self {
            listener: Box::new(listener),
            transport_factory: Arc::new(PassthroughTransportFactory),
            protocol_factory: Arc::new(BinaryProtocolFactory),
            processor,
            dispatch,
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Serves one connection at a time on the calling thread.
    pub fn simple(listener: impl ServerTransport + 'static, processor: Arc<dyn Processor>) -> Self {
        Self::new(listener, processor, Dispatch::Inline)
    }

    /// Serves connections on `manager`, which the caller starts and stops.
    pub fn thread_pool(
        listener: impl ServerTransport + 'static,
        processor: Arc<dyn Processor>,
        manager: Arc<ThreadManager>,
    ) -> Self {
        Self::new(listener, processor, Dispatch::Pool(manager))
    }

    pub fn with_transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transport_factory = factory;
        self
    }

    pub fn with_protocol_factory(mut self, factory: Arc<dyn ProtocolFactory>) -> Self {
        self.protocol_factory = factory;
        self
    }

    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    /// Binds the listener. Called by [`serve`](Self::serve) if needed.
    pub fn listen(&mut self) -> Result<(), ServerError> {
        if self.listener.local_addr().is_none() {
            self.interrupted.store(false, Ordering::SeqCst);
        }
        self.listener.listen()?;
        Ok(())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle that makes a running [`serve`](Self::serve) return, including while it
    /// waits for space in a full pool queue.
    pub fn interrupt_handle(&self) -> Arc<dyn Interrupt> {
        Arc::new(ServerInterrupt {
            listener: self.listener.interrupter(),
            interrupted: Arc::clone(&self.interrupted),
            pool: match &self.dispatch {
                Dispatch::Inline => None,
                Dispatch::Pool(manager) => Some(Arc::downgrade(manager)),
            },
        })
    }

    /// Accepts and serves connections until interrupted.
    pub fn serve(&mut self) -> Result<(), ServerError> {
        self.listen()?;
        if let Some(addr) = self.local_addr() {
            info!("serving at {addr}");
        }

        loop {
            let duplex = match self.listener.accept() {
                Ok(duplex) => duplex,
                Err(TransportError::Interrupted | TransportError::NotOpen) => break,
                Err(e) => {
                    warn!("broken connection: {e}");
                    continue;
                }
            };
            let connection = Connection::new(
                duplex,
                &*self.transport_factory,
                &*self.protocol_factory,
                Arc::clone(&self.processor),
            );

            match &self.dispatch {
                Dispatch::Inline => connection.serve(),
                Dispatch::Pool(manager) => match manager
                    .add_cancellable(Box::new(move || connection.serve()), &self.interrupted)
                {
                    Ok(()) => {}
                    Err(ConcurrencyError::QueueFull(pending)) => {
                        warn!("rejecting connection, {pending} connections already waiting");
                    }
                    Err(ConcurrencyError::Interrupted) => {
                        debug!("interrupted while waiting for a worker, dropping connection");
                        break;
                    }
                    Err(e) => {
                        error!("cannot hand connection to the worker pool: {e}");
                        self.listener.close()?;
                        return Err(e.into());
                    }
                },
            }
        }

        info!("server stopped");
        self.listener.close()?;
        Ok(())
    }
}

/// One accepted connection with its decorated protocol pair.
struct Connection {
    input: Box<dyn Protocol>,
    output: Box<dyn Protocol>,
    processor: Arc<dyn Processor>,
}

impl Connection {
    fn new(
        duplex: Duplex,
        transports: &dyn TransportFactory,
        protocols: &dyn ProtocolFactory,
        processor: Arc<dyn Processor>,
    ) -> Self {
        let Duplex { input, output } = duplex.decorate(transports);
        Self {
            input: protocols.protocol(input),
            output: protocols.protocol(output),
            processor,
        }
    }

    fn serve(mut self) {
        loop {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                self.processor.process(&mut *self.input, &mut *self.output)
            }));
            match result {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => {
                    debug!("client closed the connection");
                    break;
                }
                Ok(Err(e)) if e.is_end_of_stream() => {
                    debug!("client went away mid-request: {e}");
                    break;
                }
                Ok(Err(e)) => {
                    warn!("dropping connection: {e}");
                    break;
                }
                Err(_) => {
                    error!("processor panicked, dropping connection");
                    break;
                }
            }
        }
        self.close();
    }

    fn close(&mut self) {
        if let Err(e) = self.output.transport().close() {
            debug!("failed to close output: {e}");
        }
        if let Err(e) = self.input.transport().close() {
            debug!("failed to close input: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{IpAddr, Ipv4Addr, TcpListener},
        thread::{self, JoinHandle},
        time::{Duration, Instant},
    };

    use tempdir::TempDir;

    use crate::{
        concurrency::{Backpressure, StdThreadFactory},
        storage::{ChunkedFileWriter, Direction, LogWriter, read_chunk},
        testing::{EchoClient, echo_processor, init_logging},
        transport::{RouterTransportFactory, ServerSocket, SocketTransport, Transport},
    };

    use super::*;

    fn loopback() -> ServerSocket {
        ServerSocket::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
    }

    fn run(mut server: Server) -> (SocketAddr, Arc<dyn Interrupt>, JoinHandle<Result<(), ServerError>>) {
        server.listen().unwrap();
        let addr = server.local_addr().unwrap();
        let interrupt = server.interrupt_handle();
        (addr, interrupt, thread::spawn(move || server.serve()))
    }

    fn pool(workers: usize, backpressure: Backpressure) -> Arc<ThreadManager> {
        let manager = ThreadManager::new(workers, Arc::new(StdThreadFactory::default()))
            .with_backpressure(backpressure);
        manager.start().unwrap();
        Arc::new(manager)
    }

    #[test]
    fn simple_server_serves_connections_in_turn() {
        init_logging();
        let (addr, interrupt, server) =
            run(Server::simple(loopback(), Arc::new(echo_processor())));

        let mut first = EchoClient::connect(addr).unwrap();
        assert_eq!(first.echo("42").unwrap(), "42");
        first.close();

        let mut second = EchoClient::connect(addr).unwrap();
        assert_eq!(second.echo("again").unwrap(), "again");
        second.close();

        interrupt.interrupt();
        server.join().unwrap().unwrap();
    }

    #[test]
    fn pooled_server_keeps_connections_apart() {
        init_logging();
        let manager = pool(2, Backpressure::Unbounded);
        let (addr, interrupt, server) = run(Server::thread_pool(
            loopback(),
            Arc::new(echo_processor()),
            Arc::clone(&manager),
        ));

        let clients: Vec<_> = (0..5)
            .map(|c| {
                thread::spawn(move || {
                    let mut client = EchoClient::connect(addr).unwrap();
                    for i in 0..100 {
                        let value = format!("client {c} request {i}");
                        assert_eq!(client.echo(&value).unwrap(), value);
                    }
                    client.close();
                })
            })
            .collect();
        for client in clients {
            client.join().unwrap();
        }

        interrupt.interrupt();
        server.join().unwrap().unwrap();
        manager.stop();
    }

    #[test]
    fn garbage_drops_only_that_connection() {
        init_logging();
        let (addr, interrupt, server) =
            run(Server::simple(loopback(), Arc::new(echo_processor())));

        let mut rude = EchoClient::connect(addr).unwrap();
        rude.send_raw(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert!(rude.echo("ignored").is_err());

        let mut polite = EchoClient::connect(addr).unwrap();
        assert_eq!(polite.echo("fine").unwrap(), "fine");
        polite.close();

        interrupt.interrupt();
        server.join().unwrap().unwrap();
    }

    #[test]
    fn router_records_both_directions() {
        init_logging();
        let dir = TempDir::new("requests").unwrap();
        let writer = Arc::new(ChunkedFileWriter::open(dir.path().join("requestlog.tlog")).unwrap());
        let log: Arc<dyn LogWriter> = writer.clone();
        let server = Server::simple(loopback(), Arc::new(echo_processor()))
            .with_transport_factory(Arc::new(RouterTransportFactory::new(log, 512)));
        let (addr, interrupt, server) = run(server);

        let mut client = EchoClient::connect(addr).unwrap();
        assert_eq!(client.echo("logged").unwrap(), "logged");
        client.close();
        interrupt.interrupt();
        server.join().unwrap().unwrap();
        writer.flush().unwrap();

        let entries = read_chunk(&writer.chunk_path(writer.chunk_index())).unwrap();
        let inbound: Vec<u8> = entries
            .iter()
            .filter(|e| e.direction == Direction::Inbound)
            .flat_map(|e| e.payload.iter().copied())
            .collect();
        let outbound: Vec<u8> = entries
            .iter()
            .filter(|e| e.direction == Direction::Outbound)
            .flat_map(|e| e.payload.iter().copied())
            .collect();
        assert_eq!(&inbound[..2], &[0x74, 0x68]);
        assert_eq!(&outbound[..2], &[0x74, 0x68]);
        assert!(
            inbound
                .windows(b"logged".len())
                .any(|w| w == b"logged")
        );
    }

    #[test]
    fn full_queue_rejects_connection() {
        init_logging();
        let manager = pool(1, Backpressure::Reject { depth: 1 });
        let (addr, interrupt, server) = run(Server::thread_pool(
            loopback(),
            Arc::new(echo_processor()),
            Arc::clone(&manager),
        ));

        let mut busy = EchoClient::connect(addr).unwrap();
        assert_eq!(busy.echo("hold").unwrap(), "hold");
        let mut queued = EchoClient::connect(addr).unwrap();
        while manager.pending_task_count() == 0 {
            thread::sleep(Duration::from_millis(5));
        }
        let mut rejected = EchoClient::connect(addr).unwrap();
        assert!(rejected.echo("nope").is_err());

        busy.close();
        assert_eq!(queued.echo("served").unwrap(), "served");
        queued.close();

        interrupt.interrupt();
        server.join().unwrap().unwrap();
    }

    #[test]
    fn interrupt_releases_acceptor_blocked_on_full_queue() {
        init_logging();
        let manager = pool(1, Backpressure::Block { depth: 1 });
        let (addr, interrupt, server) = run(Server::thread_pool(
            loopback(),
            Arc::new(echo_processor()),
            Arc::clone(&manager),
        ));

        let mut busy = EchoClient::connect(addr).unwrap();
        assert_eq!(busy.echo("hold").unwrap(), "hold");
        let _queued = EchoClient::connect(addr).unwrap();
        while manager.pending_task_count() == 0 {
            thread::sleep(Duration::from_millis(5));
        }
        let _waiting = EchoClient::connect(addr).unwrap();
        thread::sleep(Duration::from_millis(100));
        assert!(!server.is_finished());

        interrupt.interrupt();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !server.is_finished() {
            assert!(Instant::now() < deadline, "serve did not return");
            thread::sleep(Duration::from_millis(5));
        }
        server.join().unwrap().unwrap();

        busy.close();
        manager.stop();
    }

    #[test]
    fn server_serves_again_after_interrupt() {
        init_logging();
        let mut server = Server::simple(loopback(), Arc::new(echo_processor()));
        let interrupt = server.interrupt_handle();

        for round in 0..2 {
            server.listen().unwrap();
            let addr = server.local_addr().unwrap();
            let serving = thread::spawn(move || {
                let result = server.serve();
                (server, result)
            });

            let mut client = EchoClient::connect(addr).unwrap();
            let value = format!("round {round}");
            assert_eq!(client.echo(&value).unwrap(), value);
            client.close();

            interrupt.interrupt();
            let (returned, result) = serving.join().unwrap();
            result.unwrap();
            server = returned;
        }
    }

    #[test]
    fn stopped_pool_ends_serve_with_error() {
        init_logging();
        let manager = pool(1, Backpressure::Unbounded);
        manager.stop();
        let (addr, _interrupt, server) = run(Server::thread_pool(
            loopback(),
            Arc::new(echo_processor()),
            manager,
        ));

        let mut socket = SocketTransport::new(addr);
        socket.open().unwrap();

        assert!(matches!(
            server.join().unwrap(),
            Err(ServerError::Concurrency(ConcurrencyError::Stopped))
        ));
    }

    #[test]
    fn listen_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut server = Server::simple(
            ServerSocket::new(taken.local_addr().unwrap()),
            Arc::new(echo_processor()),
        );

        assert!(matches!(
            server.serve(),
            Err(ServerError::Transport(TransportError::Connection(_)))
        ));
    }
}
