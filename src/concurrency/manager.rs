use std::{
    any::Any,
    collections::VecDeque,
    io, mem,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, ThreadId},
};

use log::{debug, error, info, warn};

use super::{ConcurrencyError, Monitor, Runnable, Thread, ThreadFactory};

/// What [`ThreadManager::add`] does when the task queue is full.
///
/// A depth of zero behaves as a depth of one.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Backpressure {
    #[default]
    Unbounded,
    /// The producer waits for a worker to free a slot.
    Block { depth: usize },
    /// The task is refused with [`ConcurrencyError::QueueFull`].
    Reject { depth: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Uninitialized,
    Started,
    Stopped,
}

struct Shared {
    state: ManagerState,
    tasks: VecDeque<Box<dyn Runnable>>,
    idle: usize,
    active: usize,
    blocked_producers: usize,
    wakeups: u64,
    workers: Vec<ThreadId>,
    /// Set once the first `stop` has joined every worker.
    joined: bool,
}

/// Fixed-size pool of worker threads draining a FIFO task queue.
///
/// The queue and every counter live inside one [`Monitor`]; idle workers park on it and
/// are woken one at a time as tasks arrive.
pub struct ThreadManager {
    worker_count: usize,
    factory: Arc<dyn ThreadFactory>,
    backpressure: Backpressure,
    shared: Arc<Monitor<Shared>>,
    workers: Mutex<Vec<Thread>>,
}

impl ThreadManager {
    pub fn new(worker_count: usize, factory: Arc<dyn ThreadFactory>) -> Self {
        Self {
            worker_count,
            factory,
            backpressure: Backpressure::Unbounded,
            shared: Arc::new(Monitor::new(Shared {
                state: ManagerState::Uninitialized,
                tasks: VecDeque::new(),
                idle: 0,
                active: 0,
                blocked_producers: 0,
                wakeups: 0,
                workers: Vec::with_capacity(worker_count),
                joined: false,
            })),
            workers: Mutex::new(Vec::with_capacity(worker_count)),
        }
    }

    pub fn with_backpressure(mut self, backpressure: Backpressure) -> Self {
        self.backpressure = backpressure;
        self
    }

    /// Spawns the workers. If any of them cannot be created the ones already running
    /// are stopped and the error is returned.
    pub fn start(&self) -> Result<(), ConcurrencyError> {
        if self.worker_count == 0 {
            return Err(ConcurrencyError::Resource(io::Error::new(
                io::ErrorKind::InvalidInput,
                "a thread manager needs at least one worker",
            )));
        }
        {
            let mut shared = self.shared.lock();
            match shared.state {
                ManagerState::Uninitialized => shared.state = ManagerState::Started,
                ManagerState::Started => return Err(ConcurrencyError::AlreadyStarted),
                ManagerState::Stopped => return Err(ConcurrencyError::Stopped),
            }
        }

        let mut workers = self.workers.lock().unwrap();
        for id in 0..self.worker_count {
            let shared = Arc::clone(&self.shared);
            let spawned = self
                .factory
                .new_thread(Box::new(move || worker_loop(id, &shared)))
                .and_then(|mut thread| thread.start().map(|()| thread));

            match spawned {
                Ok(thread) => workers.push(thread),
                Err(e) => {
                    error!("failed to start worker {id}: {e}");
                    drop(workers);
                    self.stop();
                    return Err(e);
                }
            }
        }

        info!("started {} workers", self.worker_count);
        Ok(())
    }

    /// Queues a task for the next free worker.
    pub fn add(&self, task: Box<dyn Runnable>) -> Result<(), ConcurrencyError> {
        self.enqueue(task, None)
    }

    /// Like [`add`](Self::add), but a producer held back by [`Backpressure::Block`]
    /// gives up with [`ConcurrencyError::Interrupted`] once `cancel` is set and
    /// [`wake_producers`](Self::wake_producers) is called.
    pub fn add_cancellable(
        &self,
        task: Box<dyn Runnable>,
        cancel: &AtomicBool,
    ) -> Result<(), ConcurrencyError> {
        self.enqueue(task, Some(cancel))
    }

    /// Wakes every producer blocked in `add` so it re-checks its cancel flag.
    pub fn wake_producers(&self) {
        self.shared.lock().notify_all();
    }

    fn enqueue(
        &self,
        task: Box<dyn Runnable>,
        cancel: Option<&AtomicBool>,
    ) -> Result<(), ConcurrencyError> {
        let mut shared = self.shared.lock();
        loop {
            match shared.state {
                ManagerState::Uninitialized => return Err(ConcurrencyError::NotStarted),
                ManagerState::Stopped => return Err(ConcurrencyError::Stopped),
                ManagerState::Started => {}
            }
            match self.backpressure {
                Backpressure::Block { depth } if shared.tasks.len() >= depth.max(1) => {
                    if cancel.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
                        return Err(ConcurrencyError::Interrupted);
                    }
                    shared.blocked_producers += 1;
                    shared = shared.wait();
                    shared.blocked_producers -= 1;
                }
                Backpressure::Reject { depth } if shared.tasks.len() >= depth.max(1) => {
                    return Err(ConcurrencyError::QueueFull(shared.tasks.len()));
                }
                _ => break,
            }
        }

        shared.tasks.push_back(task);
        // Producers share the condition variable, so a single wake-up might miss every
        // worker.
        if shared.blocked_producers > 0 {
            shared.notify_all();
        } else {
            shared.notify();
        }
        Ok(())
    }

    pub fn execute<F>(&self, f: F) -> Result<(), ConcurrencyError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.add(Box::new(f))
    }

    /// Stops the pool. Queued tasks are dropped without running; tasks already running
    /// are waited for. Later or concurrent calls wait for the first one to finish,
    /// except when made from a worker of this pool.
    pub fn stop(&self) {
        let pending = {
            let mut shared = self.shared.lock();
            if shared.state == ManagerState::Stopped {
                if !shared.workers.contains(&thread::current().id()) {
                    drop(shared.wait_while(|shared| !shared.joined));
                }
                return;
            }
            shared.state = ManagerState::Stopped;
            shared.notify_all();
            mem::take(&mut shared.tasks)
        };
        if !pending.is_empty() {
            warn!("dropping {} pending tasks", pending.len());
        }
        drop(pending);

        let mut workers = self.workers.lock().unwrap();
        for mut worker in workers.drain(..) {
            if worker.is_current() {
                debug!("{} is stopping its own pool, not joining it", worker.name());
                continue;
            }
            match worker.join() {
                Ok(()) => {}
                Err(ConcurrencyError::Detached) => debug!("{} is detached", worker.name()),
                Err(e) => warn!("failed to join {}: {e}", worker.name()),
            }
        }
        drop(workers);

        let mut shared = self.shared.lock();
        shared.joined = true;
        shared.notify_all();
        info!("thread manager stopped");
    }

    pub fn state(&self) -> ManagerState {
        self.shared.lock().state
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn idle_worker_count(&self) -> usize {
        self.shared.lock().idle
    }

    pub fn pending_task_count(&self) -> usize {
        self.shared.lock().tasks.len()
    }

    /// Pending plus running tasks.
    pub fn total_task_count(&self) -> usize {
        let shared = self.shared.lock();
        shared.tasks.len() + shared.active
    }

    /// Number of times a parked worker has woken up.
    pub fn wakeups(&self) -> u64 {
        self.shared.lock().wakeups
    }

    pub fn backpressure(&self) -> Backpressure {
        self.backpressure
    }
}

impl Drop for ThreadManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(id: usize, monitor: &Monitor<Shared>) {
    debug!("worker {id} started");
    let mut shared = monitor.lock();
    shared.idle += 1;
    shared.workers.push(thread::current().id());

    loop {
        while shared.tasks.is_empty() && shared.state != ManagerState::Stopped {
            shared = shared.wait();
            shared.wakeups += 1;
        }
        if shared.state == ManagerState::Stopped {
            break;
        }
        let Some(task) = shared.tasks.pop_front() else {
            continue;
        };
        shared.idle -= 1;
        shared.active += 1;
        if shared.blocked_producers > 0 {
            shared.notify_all();
        }
        drop(shared);

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || task.run())) {
            error!("worker {id}: task panicked: {}", panic_message(&*payload));
        }

        shared = monitor.lock();
        shared.active -= 1;
        shared.idle += 1;
    }

    shared.idle -= 1;
    debug!("worker {id} exiting");
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
