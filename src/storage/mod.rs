//! Durable request logging.
//!
//! The only artifact the serving core persists is a request log: a copy of the bytes
//! flowing through a [`RouterTransport`](crate::transport::RouterTransport), appended to
//! a shared [`LogWriter`] from every connection thread. The default writer,
//! [`ChunkedFileWriter`], stores records in size-bounded chunk files.
//! [`BufferedLogWriter`] moves the actual writing onto a background thread.
//!
//! # See Also
//!
//! - [`transport`](crate::transport): the decorator that feeds the log.
pub mod buffered;
pub mod log;

use std::io;

use bincode::error::{DecodeError, EncodeError};
use thiserror::Error;

use crate::concurrency::ConcurrencyError;

pub use self::buffered::BufferedLogWriter;
pub use self::log::{
    ChunkedFileWriter, Direction, LogEntry, LogWriter, RECORD_OVERHEAD, read_chunk,
};

#[derive(Debug, Error)]
pub enum LogError {
    #[error("log IO error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode log entry: {0}")]
    Encode(#[from] EncodeError),
    #[error("failed to decode log entry: {0}")]
    Decode(#[from] DecodeError),
    #[error("event of {size} bytes exceeds the maximum event size of {max} bytes")]
    EventTooLarge { size: usize, max: usize },
    #[error("invalid log configuration: {0}")]
    Config(String),
    #[error("request log queue is full ({capacity} events waiting)")]
    QueueFull { capacity: usize },
    #[error("request log is closed")]
    Closed,
    #[error("request log writer thread: {0}")]
    Writer(#[from] ConcurrencyError),
}
