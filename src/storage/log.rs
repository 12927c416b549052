//! Chunked request log.
//!
//! Every event handed to a [`LogWriter`] becomes one [`LogEntry`] record. The
//! [`ChunkedFileWriter`] appends records to numbered chunk files next to a base path:
//!
//! ```text
//! requestlog.tlog.000000
//! requestlog.tlog.000001
//! ...
//! ```
//!
//! # Record format
//!
//! Records are bincode-encoded (big-endian, fixed-width integers): an 8-byte sequence
//! number, a 4-byte direction tag, an 8-byte payload length and the payload itself. A
//! record never straddles two chunks; when the next record would push a chunk past the
//! configured chunk size, the writer rotates to the next chunk first.
//!
//! # Size limits
//!
//! Events larger than `max_event_size` are rejected with
//! [`LogError::EventTooLarge`] and counted in
//! [`dropped_events`](ChunkedFileWriter::dropped_events). The writer stays usable.
//!
//! A chunk that fails a write is abandoned, since it may end in a partial record. The
//! writer continues in the next chunk.
//!
//! # Concurrency
//!
//! A writer is shared by every connection thread. All chunk and sequence state sits
//! behind one internal mutex, so callers must not hold other locks while appending.
use std::{
    ffi::OsString,
    fs::{File, OpenOptions},
    io::{self, BufReader, BufWriter, Write},
    mem,
    path::{Path, PathBuf},
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint},
    decode_from_std_read, encode_to_vec,
    error::DecodeError,
};
use log::{debug, info, warn};

use super::LogError;

/// Bytes a record adds on top of its payload.
pub const RECORD_OVERHEAD: usize = 20;

pub const DEFAULT_CHUNK_SIZE: u64 = 2 * 1024 * 1024;
pub const DEFAULT_MAX_EVENT_SIZE: usize = 16 * 1024;

/// Which way the logged bytes were travelling.
#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq)]
pub enum Direction {
    /// Read from the peer.
    Inbound,
    /// Written to the peer.
    Outbound,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct LogEntry {
    pub sequence: u64,
    pub direction: Direction,
    pub payload: Vec<u8>,
}

/// Append-only sink for transport traffic.
pub trait LogWriter: Send + Sync {
    fn append(&self, direction: Direction, event: &[u8]) -> Result<(), LogError>;

    fn flush(&self) -> Result<(), LogError>;
}

type ChunkFile = Box<dyn Write + Send>;
type OpenChunk = fn(&Path) -> io::Result<ChunkFile>;

struct ChunkState {
    writer: BufWriter<ChunkFile>,
    index: u32,
    written: u64,
    sequence: u64,
    broken: bool,
}

pub struct ChunkedFileWriter {
    base: PathBuf,
    chunk_size: u64,
    max_event_size: usize,
    config: Configuration<BigEndian, Fixint>,
    open_file: OpenChunk,
    state: Mutex<ChunkState>,
    dropped: AtomicU64,
}

impl ChunkedFileWriter {
    pub fn open(base: PathBuf) -> Result<Self, LogError> {
        Self::with_limits(base, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_EVENT_SIZE)
    }

    /// Opens a writer that starts a fresh chunk after any chunks already present at
    /// `base`.
    pub fn with_limits(
        base: PathBuf,
        chunk_size: u64,
        max_event_size: usize,
    ) -> Result<Self, LogError> {
        Self::build(base, chunk_size, max_event_size, open_file)
    }

    fn build(
        base: PathBuf,
        chunk_size: u64,
        max_event_size: usize,
        open_file: OpenChunk,
    ) -> Result<Self, LogError> {
        let fits = max_event_size
            .checked_add(RECORD_OVERHEAD)
            .and_then(|record| u64::try_from(record).ok())
            .is_some_and(|record| record <= chunk_size);
        if !fits {
            return Err(LogError::Config(format!(
                "chunk size {chunk_size} cannot hold an event of {max_event_size} bytes"
            )));
        }

        let mut index = 0;
        while chunk_path(&base, index).exists() {
            index += 1;
        }
        let writer = open_chunk(&base, index, open_file)?;
        info!(
            "request log at {} (chunk {index}, chunk size {chunk_size}, max event {max_event_size})",
            base.display()
        );

        Ok(Self {
            base,
            chunk_size,
            max_event_size,
            config: bincode::config::standard()
                .with_big_endian()
                .with_fixed_int_encoding(),
            open_file,
            state: Mutex::new(ChunkState {
                writer,
                index,
                written: 0,
                sequence: 0,
                broken: false,
            }),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn max_event_size(&self) -> usize {
        self.max_event_size
    }

    /// Index of the chunk currently being appended to.
    pub fn chunk_index(&self) -> u32 {
        self.state.lock().unwrap().index
    }

    /// Path of chunk `index` for this writer.
    pub fn chunk_path(&self, index: u32) -> PathBuf {
        chunk_path(&self.base, index)
    }

    /// Number of events rejected since the writer was opened.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn rotate(&self, state: &mut ChunkState) -> Result<(), LogError> {
        if let Err(e) = state.writer.flush() {
            state.broken = true;
            return Err(e.into());
        }
        let index = state.index + 1;
        state.writer = open_chunk(&self.base, index, self.open_file)?;
        state.index = index;
        state.written = 0;
        debug!("request log rotated to chunk {index}");
        Ok(())
    }

    /// Moves to the next chunk without flushing the current one.
    fn abandon(&self, state: &mut ChunkState) -> Result<(), LogError> {
        let index = state.index + 1;
        let fresh = open_chunk(&self.base, index, self.open_file)?;
        let (_, unwritten) = mem::replace(&mut state.writer, fresh).into_parts();
        warn!(
            "abandoned request log chunk {} ({} buffered bytes lost)",
            state.index,
            unwritten.map_or(0, |buf| buf.len())
        );
        state.index = index;
        state.written = 0;
        state.broken = false;
        Ok(())
    }
}

impl LogWriter for ChunkedFileWriter {
    fn append(&self, direction: Direction, event: &[u8]) -> Result<(), LogError> {
        if event.len() > self.max_event_size {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(
                "dropping {} byte {direction:?} event, limit is {}",
                event.len(),
                self.max_event_size
            );
            return Err(LogError::EventTooLarge {
                size: event.len(),
                max: self.max_event_size,
            });
        }

        let mut state = self.state.lock().unwrap();
        let entry = LogEntry {
            sequence: state.sequence,
            direction,
            payload: event.to_vec(),
        };
        let record = encode_to_vec(entry, self.config)?;

        if state.broken {
            self.abandon(&mut state)?;
        } else if state.written > 0 && state.written + record.len() as u64 > self.chunk_size {
            self.rotate(&mut state)?;
        }
        if let Err(e) = state.writer.write_all(&record) {
            state.broken = true;
            if let Err(reopen) = self.abandon(&mut state) {
                warn!("cannot open a fresh request log chunk: {reopen}");
            }
            return Err(e.into());
        }
        state.written += record.len() as u64;
        state.sequence += 1;
        Ok(())
    }

    fn flush(&self) -> Result<(), LogError> {
        let mut state = self.state.lock().unwrap();
        if let Err(e) = state.writer.flush() {
            state.broken = true;
            return Err(e.into());
        }
        Ok(())
    }
}

fn chunk_path(base: &Path, index: u32) -> PathBuf {
    let mut name = OsString::from(base.as_os_str());
    name.push(format!(".{index:06}"));
    PathBuf::from(name)
}

fn open_file(path: &Path) -> io::Result<ChunkFile> {
    let f = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(Box::new(f))
}

fn open_chunk(
    base: &Path,
    index: u32,
    open_file: OpenChunk,
) -> Result<BufWriter<ChunkFile>, LogError> {
    Ok(BufWriter::new(open_file(&chunk_path(base, index))?))
}

/// Decodes every complete record in one chunk file. A truncated trailing record is
/// ignored.
pub fn read_chunk(path: &Path) -> Result<Vec<LogEntry>, LogError> {
    let config = bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding();
    let mut reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();

    loop {
        match decode_from_std_read::<LogEntry, _, _>(&mut reader, config) {
            Ok(entry) => entries.push(entry),
            Err(DecodeError::Io { inner, .. }) if inner.kind() == io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(entries)
}
