use std::sync::Arc;

use log::debug;

use crate::storage::{Direction, LogWriter};

use super::{BufferedTransport, Transport, TransportError, TransportFactory};

/// Decorator that copies every byte it moves into a shared [`LogWriter`].
///
/// Each successful inner `read` is logged as one [`Direction::Inbound`] event and each
/// `write` as one [`Direction::Outbound`] event. The primary stream always goes first
/// and is never affected by the log: a failed or rejected append is reported at `debug`
/// level (the writer keeps its own count) and the bytes still pass through.
pub struct RouterTransport {
    inner: Box<dyn Transport>,
    log: Arc<dyn LogWriter>,
}

impl RouterTransport {
    pub fn new(inner: Box<dyn Transport>, log: Arc<dyn LogWriter>) -> Self {
        Self { inner, log }
    }

    fn record(&self, direction: Direction, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        if let Err(e) = self.log.append(direction, bytes) {
            debug!("request log skipped {} bytes: {e}", bytes.len());
        }
    }
}

impl Transport for RouterTransport {
    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn open(&mut self) -> Result<(), TransportError> {
        self.inner.open()
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if let Err(e) = self.log.flush() {
            debug!("request log flush failed: {e}");
        }
        self.inner.close()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let n = self.inner.read(buf)?;
        self.record(Direction::Inbound, &buf[..n]);
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        self.inner.write(buf)?;
        self.record(Direction::Outbound, buf);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        self.inner.flush()
    }
}

/// Builds `BufferedTransport(RouterTransport(raw))` chains sharing one log writer.
#[derive(Clone)]
pub struct RouterTransportFactory {
    log: Arc<dyn LogWriter>,
    capacity: usize,
}

impl RouterTransportFactory {
    pub fn new(log: Arc<dyn LogWriter>, capacity: usize) -> Self {
        Self { log, capacity }
    }
}

impl TransportFactory for RouterTransportFactory {
    fn transport(&self, inner: Box<dyn Transport>) -> Box<dyn Transport> {
        let router = RouterTransport::new(inner, Arc::clone(&self.log));
        Box::new(BufferedTransport::with_capacity(
            self.capacity,
            Box::new(router),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tempdir::TempDir;

    use crate::{
        storage::{ChunkedFileWriter, LogError, read_chunk},
        transport::MemoryTransport,
    };

    use super::*;

    #[derive(Default)]
    struct RecordingLog {
        max_event_size: usize,
        events: Mutex<Vec<(Direction, Vec<u8>)>>,
        errors: Mutex<usize>,
    }

    impl RecordingLog {
        fn with_max(max_event_size: usize) -> Self {
            Self {
                max_event_size,
                ..Default::default()
            }
        }

        fn bytes(&self, direction: Direction) -> Vec<u8> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|(d, _)| *d == direction)
                .flat_map(|(_, b)| b.clone())
                .collect()
        }
    }

    impl LogWriter for RecordingLog {
        fn append(&self, direction: Direction, event: &[u8]) -> Result<(), LogError> {
            if event.len() > self.max_event_size {
                *self.errors.lock().unwrap() += 1;
                return Err(LogError::EventTooLarge {
                    size: event.len(),
                    max: self.max_event_size,
                });
            }
            self.events
                .lock()
                .unwrap()
                .push((direction, event.to_vec()));
            Ok(())
        }

        fn flush(&self) -> Result<(), LogError> {
            Ok(())
        }
    }

    #[test]
    fn writes_are_teed_in_order() {
        let log = Arc::new(RecordingLog::with_max(64));
        let inner = MemoryTransport::new(Vec::new());
        let handle = inner.handle();
        let mut transport = RouterTransport::new(Box::new(inner), log.clone());

        for chunk in [&b"first "[..], b"second ", b"third"] {
            transport.write(chunk).unwrap();
        }

        assert_eq!(handle.written(), b"first second third");
        assert_eq!(log.bytes(Direction::Outbound), b"first second third");
    }

    #[test]
    fn reads_are_teed() {
        let log = Arc::new(RecordingLog::with_max(64));
        let inner = MemoryTransport::new(b"incoming request".to_vec()).with_read_limit(5);
        let mut transport = RouterTransport::new(Box::new(inner), log.clone());
        let mut buf = [0u8; 16];

        transport.read_all(&mut buf).unwrap();

        assert_eq!(&buf, b"incoming request");
        assert_eq!(log.bytes(Direction::Inbound), b"incoming request");
        assert!(log.bytes(Direction::Outbound).is_empty());
    }

    #[test]
    fn oversized_event_still_reaches_primary() {
        let log = Arc::new(RecordingLog::with_max(4));
        let inner = MemoryTransport::new(Vec::new());
        let handle = inner.handle();
        let mut transport = RouterTransport::new(Box::new(inner), log.clone());

        transport.write(b"ok").unwrap();
        transport.write(b"much too long").unwrap();
        transport.write(b"fine").unwrap();

        assert_eq!(handle.written(), b"okmuch too longfine");
        assert_eq!(log.bytes(Direction::Outbound), b"okfine");
        assert_eq!(*log.errors.lock().unwrap(), 1);
    }

    #[test]
    fn factory_chain_logs_to_file() {
        let temp = TempDir::new("router").unwrap();
        let log = Arc::new(
            ChunkedFileWriter::with_limits(temp.path().join("requests.tlog"), 4096, 32).unwrap(),
        );
        let inner = MemoryTransport::new(Vec::new());
        let handle = inner.handle();
        let factory = RouterTransportFactory::new(log.clone(), 16);
        let mut transport = factory.transport(Box::new(inner));

        transport.write(b"hello ").unwrap();
        transport.write(b"world").unwrap();
        transport.write(&[b'x'; 40]).unwrap();
        transport.close().unwrap();

        let mut expected = b"hello world".to_vec();
        expected.extend_from_slice(&[b'x'; 40]);
        assert_eq!(handle.written(), expected);

        let entries = read_chunk(&log.chunk_path(0)).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload, b"hello world");
        assert_eq!(log.dropped_events(), 1);
    }
}
