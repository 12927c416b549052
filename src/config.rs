//! Command-line configuration for assembling a [`Server`].
//!
//! [`ServerConfig`] is a clap `Args` group, so a binary embeds it with
//! `#[command(flatten)]` next to its own flags and then calls
//! [`ServerConfig::build`] with its processor.
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use clap::{Args, ValueEnum};
use log::info;

use crate::{
    concurrency::{Backpressure, Policy, Priority, StdThreadFactory, ThreadConfig, ThreadManager},
    processor::Processor,
    server::{Server, ServerError},
    storage::{
        BufferedLogWriter, ChunkedFileWriter,
        buffered::DEFAULT_QUEUE_CAPACITY,
        log::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_EVENT_SIZE},
    },
    transport::{
        BufferedTransportFactory, DEFAULT_BUFFER_SIZE, RouterTransportFactory, ServerSocket,
        TransportFactory,
    },
};

pub const DEFAULT_PORT: u16 = 9090;
pub const DEFAULT_REQUEST_LOG: &str = "./requestlog.tlog";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ServerType {
    Simple,
    ThreadPool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackpressureMode {
    /// Hold the acceptor until a worker frees a queue slot
    Block,
    /// Close connections that arrive while the queue is full
    Reject,
    /// Queue without limit
    Unbounded,
}

#[derive(Debug, Clone, Args)]
pub struct ServerConfig {
    /// Address to bind
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub host: IpAddr,
    /// Port to listen on
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,
    /// How connections are served
    #[arg(long, value_enum, default_value_t = ServerType::ThreadPool)]
    pub server_type: ServerType,
    /// Worker threads of the thread-pool server
    #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u16).range(1..))]
    pub workers: u16,
    /// Connections allowed to wait for a worker
    #[arg(long, default_value_t = 1024)]
    pub queue_depth: usize,
    /// What to do with connections once the queue is full
    #[arg(long, value_enum, default_value_t = BackpressureMode::Block)]
    pub backpressure: BackpressureMode,
    /// Per-connection read and write buffer size in bytes
    #[arg(long, default_value_t = DEFAULT_BUFFER_SIZE)]
    pub buffer_size: usize,
    /// Record request traffic to chunk files at this path
    #[arg(long, num_args = 0..=1, default_missing_value = DEFAULT_REQUEST_LOG)]
    pub log_requests: Option<PathBuf>,
    /// Request log chunk size in bytes
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: u64,
    /// Largest request log event in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_EVENT_SIZE)]
    pub max_event_size: usize,
    /// Request log events allowed to wait for the log writer thread
    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub log_queue_size: usize,
    /// Scheduling policy of worker threads
    #[arg(long, value_enum, default_value_t = Policy::Default)]
    pub policy: Policy,
    /// Scheduling priority of worker threads
    #[arg(long, value_enum, default_value_t = Priority::Normal)]
    pub priority: Priority,
    /// Worker stack size in bytes
    #[arg(long)]
    pub stack_size: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            server_type: ServerType::ThreadPool,
            workers: 4,
            queue_depth: 1024,
            backpressure: BackpressureMode::Block,
            buffer_size: DEFAULT_BUFFER_SIZE,
            log_requests: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_event_size: DEFAULT_MAX_EVENT_SIZE,
            log_queue_size: DEFAULT_QUEUE_CAPACITY,
            policy: Policy::default(),
            priority: Priority::default(),
            stack_size: None,
        }
    }
}

impl ServerConfig {
    pub fn address(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn backpressure(&self) -> Backpressure {
        match self.backpressure {
            BackpressureMode::Block => Backpressure::Block {
                depth: self.queue_depth,
            },
            BackpressureMode::Reject => Backpressure::Reject {
                depth: self.queue_depth,
            },
            BackpressureMode::Unbounded => Backpressure::Unbounded,
        }
    }

    pub fn thread_config(&self) -> ThreadConfig {
        ThreadConfig {
            policy: self.policy,
            priority: self.priority,
            stack_size: self.stack_size,
            name_prefix: "thrum-worker".to_string(),
            detached: false,
        }
    }

    /// Assembles a server around `processor`. For the thread-pool type the worker pool
    /// is started here; the server is not yet listening.
    pub fn build(&self, processor: Arc<dyn Processor>) -> Result<Server, ServerError> {
        let transports: Arc<dyn TransportFactory> = match &self.log_requests {
            Some(path) => {
                let chunks = ChunkedFileWriter::with_limits(
                    path.clone(),
                    self.chunk_size,
                    self.max_event_size,
                )?;
                let writer = StdThreadFactory::new(ThreadConfig {
                    name_prefix: "thrum-log".to_string(),
                    ..self.thread_config()
                });
                let log = BufferedLogWriter::new(Arc::new(chunks), self.log_queue_size, &writer)?;
                Arc::new(RouterTransportFactory::new(Arc::new(log), self.buffer_size))
            }
            None => Arc::new(BufferedTransportFactory::new(self.buffer_size)),
        };

        let listener = ServerSocket::new(self.address());
        let server = match self.server_type {
            ServerType::Simple => Server::simple(listener, processor),
            ServerType::ThreadPool => {
                let factory = Arc::new(StdThreadFactory::new(self.thread_config()));
                let manager = ThreadManager::new(self.workers.into(), factory)
                    .with_backpressure(self.backpressure());
                manager.start()?;
                Server::thread_pool(listener, processor, Arc::new(manager))
            }
        };
        info!(
            "configured {:?} server for {}",
            self.server_type,
            self.address()
        );

        Ok(server.with_transport_factory(transports))
    }
}
