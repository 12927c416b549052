use std::{
    mem,
    sync::atomic::{AtomicUsize, Ordering},
    thread::{self, JoinHandle, ThreadId},
};

use clap::ValueEnum;
use log::debug;

use super::{ConcurrencyError, Runnable};

/// OS scheduling policy for new threads.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Policy {
    #[default]
    Default,
    Fifo,
    RoundRobin,
}

/// Priority relative to the range the policy allows.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum Priority {
    Lowest,
    Lower,
    Low,
    #[default]
    Normal,
    High,
    Higher,
    Highest,
}

impl Priority {
    pub fn ordinal(self) -> i32 {
        self as i32
    }
}

#[derive(Debug, Clone)]
pub struct ThreadConfig {
    pub policy: Policy,
    pub priority: Priority,
    /// Stack size in bytes; `None` keeps the platform default.
    pub stack_size: Option<usize>,
    pub name_prefix: String,
    pub detached: bool,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            policy: Policy::default(),
            priority: Priority::default(),
            stack_size: None,
            name_prefix: "thrum".to_string(),
            detached: false,
        }
    }
}

/// Creates unstarted [`Thread`]s bound to a runnable.
pub trait ThreadFactory: Send + Sync {
    fn new_thread(&self, runnable: Box<dyn Runnable>) -> Result<Thread, ConcurrencyError>;
}

/// [`ThreadFactory`] backed by `std::thread`.
#[derive(Debug, Default)]
pub struct StdThreadFactory {
    config: ThreadConfig,
    spawned: AtomicUsize,
}

impl StdThreadFactory {
    pub fn new(config: ThreadConfig) -> Self {
        Self {
            config,
            spawned: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &ThreadConfig {
        &self.config
    }
}

impl ThreadFactory for StdThreadFactory {
    fn new_thread(&self, runnable: Box<dyn Runnable>) -> Result<Thread, ConcurrencyError> {
        if self.config.stack_size == Some(0) {
            return Err(ConcurrencyError::Resource(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "stack size must be non-zero",
            )));
        }
        let n = self.spawned.fetch_add(1, Ordering::Relaxed);
        Ok(Thread {
            name: format!("{}-{n}", self.config.name_prefix),
            config: self.config.clone(),
            state: ThreadState::Created(runnable),
        })
    }
}

enum ThreadState {
    Created(Box<dyn Runnable>),
    Running(JoinHandle<()>),
    Joined,
    Detached,
    Failed,
}

/// OS thread with an explicit `start`/`join` lifecycle.
pub struct Thread {
    name: String,
    config: ThreadConfig,
    state: ThreadState,
}

impl Thread {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Id of the running thread; `None` before start or after join.
    pub fn id(&self) -> Option<ThreadId> {
        match &self.state {
            ThreadState::Running(handle) => Some(handle.thread().id()),
            _ => None,
        }
    }

    pub fn is_current(&self) -> bool {
        self.id() == Some(thread::current().id())
    }

    pub fn start(&mut self) -> Result<(), ConcurrencyError> {
        let runnable = match mem::replace(&mut self.state, ThreadState::Failed) {
            ThreadState::Created(runnable) => runnable,
            other => {
                self.state = other;
                return Err(ConcurrencyError::AlreadyStarted);
            }
        };

        let mut builder = thread::Builder::new().name(self.name.clone());
        if let Some(size) = self.config.stack_size {
            builder = builder.stack_size(size);
        }
        let (policy, priority) = (self.config.policy, self.config.priority);
        let handle = builder.spawn(move || {
            apply_scheduling(policy, priority);
            runnable.run();
        })?;

        debug!("started thread {}", self.name);
        self.state = if self.config.detached {
            ThreadState::Detached
        } else {
            ThreadState::Running(handle)
        };
        Ok(())
    }

    /// Blocks until the runnable returns.
    pub fn join(&mut self) -> Result<(), ConcurrencyError> {
        match mem::replace(&mut self.state, ThreadState::Joined) {
            ThreadState::Running(handle) => handle
                .join()
                .map_err(|_| ConcurrencyError::Panicked(self.name.clone())),
            ThreadState::Joined => Err(ConcurrencyError::AlreadyJoined),
            other => {
                let err = match other {
                    ThreadState::Detached => ConcurrencyError::Detached,
                    _ => ConcurrencyError::NotStarted,
                };
                self.state = other;
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            ThreadState::Created(_) => "created",
            ThreadState::Running(_) => "running",
            ThreadState::Joined => "joined",
            ThreadState::Detached => "detached",
            ThreadState::Failed => "failed",
        };
        f.debug_struct("Thread")
            .field("name", &self.name)
            .field("state", &state)
            .finish()
    }
}

#[cfg(target_os = "linux")]
fn apply_scheduling(policy: Policy, priority: Priority) {
    use std::io;

    use log::warn;

    match policy {
        Policy::Default if priority == Priority::Normal => {}
        Policy::Default => {
            // Nice values run from 19 (lowest) to -20 (highest).
            let nice = match priority {
                Priority::Lowest => 19,
                Priority::Lower => 10,
                Priority::Low => 5,
                Priority::Normal => 0,
                Priority::High => -5,
                Priority::Higher => -10,
                Priority::Highest => -20,
            };
            // SAFETY: PRIO_PROCESS with id 0 only adjusts the calling thread on Linux.
            if unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, nice) } != 0 {
                warn!(
                    "could not set {priority:?} priority: {}",
                    io::Error::last_os_error()
                );
            }
        }
        Policy::Fifo | Policy::RoundRobin => {
            let native = if policy == Policy::Fifo {
                libc::SCHED_FIFO
            } else {
                libc::SCHED_RR
            };
            // SAFETY: plain queries with a valid policy constant.
            let (min, max) = unsafe {
                (
                    libc::sched_get_priority_min(native),
                    libc::sched_get_priority_max(native),
                )
            };
            // SAFETY: sched_param is plain old data.
            let mut param: libc::sched_param = unsafe { mem::zeroed() };
            param.sched_priority =
                min + (max - min) * priority.ordinal() / Priority::Highest.ordinal();
            // SAFETY: pid 0 targets the calling thread and param outlives the call.
            if unsafe { libc::sched_setscheduler(0, native, &param) } != 0 {
                warn!(
                    "could not apply {policy:?} scheduling: {}",
                    io::Error::last_os_error()
                );
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_scheduling(policy: Policy, priority: Priority) {
    if policy != Policy::Default || priority != Priority::Normal {
        debug!("thread scheduling knobs are not supported on this platform");
    }
}
