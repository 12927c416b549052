//! Queued request logging.
//!
//! [`BufferedLogWriter`] puts a bounded queue and a dedicated writer thread in front of
//! another [`LogWriter`], so connection threads only pay for a copy and a lock. When the
//! queue is full the event is dropped and counted instead of stalling the connection.
use std::{
    collections::VecDeque,
    mem,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use log::{debug, error, warn};

use super::{Direction, LogError, LogWriter};
use crate::concurrency::{Monitor, Thread, ThreadFactory};

pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

struct Queue {
    events: VecDeque<(Direction, Vec<u8>)>,
    /// The writer thread holds a batch it has not finished handing to the sink.
    writing: bool,
    closed: bool,
}

pub struct BufferedLogWriter {
    sink: Arc<dyn LogWriter>,
    queue: Arc<Monitor<Queue>>,
    capacity: usize,
    dropped: AtomicU64,
    writer: Mutex<Option<Thread>>,
}

impl BufferedLogWriter {
    /// Starts the writer thread on `factory`. At most `capacity` events wait for it.
    pub fn new(
        sink: Arc<dyn LogWriter>,
        capacity: usize,
        factory: &dyn ThreadFactory,
    ) -> Result<Self, LogError> {
        if capacity == 0 {
            return Err(LogError::Config(
                "request log queue needs room for at least one event".to_string(),
            ));
        }
        let queue = Arc::new(Monitor::new(Queue {
            events: VecDeque::with_capacity(capacity),
            writing: false,
            closed: false,
        }));

        let mut writer = {
            let queue = Arc::clone(&queue);
            let sink = Arc::clone(&sink);
            factory.new_thread(Box::new(move || drain(&queue, &*sink)))?
        };
        writer.start()?;
        debug!("request log writer {} started", writer.name());

        Ok(Self {
            sink,
            queue,
            capacity,
            dropped: AtomicU64::new(0),
            writer: Mutex::new(Some(writer)),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events queued but not yet taken by the writer thread.
    pub fn pending(&self) -> usize {
        self.queue.lock().events.len()
    }

    /// Events refused because the queue was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn close(&self) {
        let Some(mut writer) = self.writer.lock().unwrap().take() else {
            return;
        };
        {
            let mut queue = self.queue.lock();
            queue.closed = true;
            queue.notify_all();
        }
        if writer.is_current() {
            return;
        }
        if let Err(e) = writer.join() {
            warn!("request log writer did not stop cleanly: {e}");
        }
        if let Err(e) = self.sink.flush() {
            warn!("failed to flush request log: {e}");
        }
    }
}

impl LogWriter for BufferedLogWriter {
    fn append(&self, direction: Direction, event: &[u8]) -> Result<(), LogError> {
        let mut queue = self.queue.lock();
        if queue.closed {
            return Err(LogError::Closed);
        }
        if queue.events.len() >= self.capacity {
            drop(queue);
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped.is_power_of_two() {
                warn!("request log queue full, {dropped} events dropped so far");
            }
            return Err(LogError::QueueFull {
                capacity: self.capacity,
            });
        }
        queue.events.push_back((direction, event.to_vec()));
        // Flushers wait on the same condition variable as the writer thread.
        queue.notify_all();
        Ok(())
    }

    /// Waits until every queued event has reached the sink, then flushes the sink.
    fn flush(&self) -> Result<(), LogError> {
        let queue = self
            .queue
            .lock()
            .wait_while(|queue| !queue.closed && (queue.writing || !queue.events.is_empty()));
        drop(queue);
        self.sink.flush()
    }
}

impl Drop for BufferedLogWriter {
    fn drop(&mut self) {
        self.close();
    }
}

fn drain(queue: &Monitor<Queue>, sink: &dyn LogWriter) {
    let mut guard = queue.lock();
    loop {
        guard = guard.wait_while(|queue| queue.events.is_empty() && !queue.closed);
        if guard.events.is_empty() {
            break;
        }
        let batch = mem::take(&mut guard.events);
        guard.writing = true;
        drop(guard);

        for (direction, event) in batch {
            match panic::catch_unwind(AssertUnwindSafe(|| sink.append(direction, &event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("request log sink refused event: {e}"),
                Err(_) => error!("request log sink panicked"),
            }
        }

        guard = queue.lock();
        guard.writing = false;
        guard.notify_all();
    }
    debug!("request log writer exiting");
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use crate::concurrency::{StdThreadFactory, ThreadConfig};

    use super::*;

    /// Sink that holds every append until it is opened.
    #[derive(Default)]
    struct GatedLog {
        open: Monitor<bool>,
        events: Mutex<Vec<(Direction, Vec<u8>)>>,
        flushes: AtomicU64,
    }

    impl GatedLog {
        fn open(&self) {
            let mut open = self.open.lock();
            *open = true;
            open.notify_all();
        }

        fn payloads(&self) -> Vec<Vec<u8>> {
            let events = self.events.lock().unwrap();
            events.iter().map(|(_, event)| event.clone()).collect()
        }
    }

    impl LogWriter for GatedLog {
        fn append(&self, direction: Direction, event: &[u8]) -> Result<(), LogError> {
            drop(self.open.lock().wait_while(|open| !*open));
            self.events
                .lock()
                .unwrap()
                .push((direction, event.to_vec()));
            Ok(())
        }

        fn flush(&self) -> Result<(), LogError> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn factory() -> StdThreadFactory {
        StdThreadFactory::new(ThreadConfig {
            name_prefix: "thrum-log".to_string(),
            ..ThreadConfig::default()
        })
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn append_does_not_wait_for_a_slow_sink() {
        let sink = Arc::new(GatedLog::default());
        let log = BufferedLogWriter::new(sink.clone(), 2, &factory()).unwrap();

        log.append(Direction::Inbound, b"first").unwrap();
        wait_until(|| log.pending() == 0);

        let started = Instant::now();
        log.append(Direction::Inbound, b"second").unwrap();
        log.append(Direction::Outbound, b"third").unwrap();
        assert!(matches!(
            log.append(Direction::Inbound, b"fourth"),
            Err(LogError::QueueFull { capacity: 2 })
        ));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(log.dropped_events(), 1);
        assert!(sink.payloads().is_empty());

        sink.open();
        log.flush().unwrap();
        assert_eq!(
            sink.payloads(),
            vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]
        );
        assert!(sink.flushes.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn drop_delivers_queued_events() {
        let sink = Arc::new(GatedLog::default());
        sink.open();
        let log = BufferedLogWriter::new(sink.clone(), 16, &factory()).unwrap();

        for i in 0..10u8 {
            log.append(Direction::Inbound, &[i]).unwrap();
        }
        drop(log);

        assert_eq!(sink.payloads(), (0..10u8).map(|i| vec![i]).collect::<Vec<_>>());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let sink = Arc::new(GatedLog::default());

        assert!(matches!(
            BufferedLogWriter::new(sink, 0, &factory()),
            Err(LogError::Config(_))
        ));
    }

    #[test]
    fn failed_thread_start_is_reported() {
        let sink = Arc::new(GatedLog::default());
        let factory = StdThreadFactory::new(ThreadConfig {
            stack_size: Some(0),
            ..ThreadConfig::default()
        });

        assert!(matches!(
            BufferedLogWriter::new(sink, 4, &factory),
            Err(LogError::Writer(_))
        ));
    }
}
