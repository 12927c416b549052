//! Thread facility used by the pooled server.
//!
//! - [`Runnable`]: a unit of work run exactly once on some thread.
//! - [`Thread`] and [`ThreadFactory`]: OS threads with explicit start and join, built
//!   from a [`ThreadConfig`] (scheduling policy, priority, stack size).
//! - [`Monitor`]: a mutex and condition variable whose wait/notify can only be used
//!   while holding the lock.
//! - [`ThreadManager`]: a fixed pool of workers draining a FIFO task queue.
mod manager;
mod monitor;
mod thread;

use std::io;

use thiserror::Error;

pub use manager::{Backpressure, ManagerState, ThreadManager};
pub use monitor::{Monitor, MonitorGuard};
pub use thread::{Policy, Priority, StdThreadFactory, Thread, ThreadConfig, ThreadFactory};

#[derive(Debug, Error)]
pub enum ConcurrencyError {
    #[error("already started")]
    AlreadyStarted,
    #[error("not started")]
    NotStarted,
    #[error("thread was already joined")]
    AlreadyJoined,
    #[error("thread is detached and cannot be joined")]
    Detached,
    #[error("thread manager is stopped")]
    Stopped,
    #[error("task queue is full ({0} pending)")]
    QueueFull(usize),
    #[error("interrupted while waiting for queue space")]
    Interrupted,
    #[error("thread '{0}' panicked")]
    Panicked(String),
    #[error("failed to create thread: {0}")]
    Resource(#[from] io::Error),
}

/// Work item executed exactly once.
pub trait Runnable: Send + 'static {
    fn run(self: Box<Self>);
}

impl<F> Runnable for F
where
    F: FnOnce() + Send + 'static,
{
    fn run(self: Box<Self>) {
        (*self)()
    }
}
