use std::{
    ops::{Deref, DerefMut},
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

/// Mutex-protected state paired with a condition variable.
///
/// Waiting and notifying go through [`MonitorGuard`], so both can only happen while the
/// lock is held. Waits may wake spuriously; callers re-check their condition in a loop.
///
/// A panic while the lock is held does not poison the monitor for other users.
#[derive(Debug, Default)]
pub struct Monitor<T> {
    state: Mutex<T>,
    cond: Condvar,
}

impl<T> Monitor<T> {
    pub fn new(state: T) -> Self {
        Self {
            state: Mutex::new(state),
            cond: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MonitorGuard<'_, T> {
        MonitorGuard {
            guard: self.state.lock().unwrap_or_else(PoisonError::into_inner),
            cond: &self.cond,
        }
    }
}

pub struct MonitorGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    cond: &'a Condvar,
}

impl<'a, T> MonitorGuard<'a, T> {
    /// Releases the lock until notified, then re-acquires it.
    pub fn wait(self) -> Self {
        let MonitorGuard { guard, cond } = self;
        let guard = cond.wait(guard).unwrap_or_else(PoisonError::into_inner);
        Self { guard, cond }
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`. The flag is `true` if the
    /// timeout elapsed.
    pub fn wait_timeout(self, timeout: Duration) -> (Self, bool) {
        let MonitorGuard { guard, cond } = self;
        let (guard, result) = cond
            .wait_timeout(guard, timeout)
            .unwrap_or_else(PoisonError::into_inner);
        (Self { guard, cond }, result.timed_out())
    }

    /// Waits until `condition` returns `false`.
    pub fn wait_while<F>(mut self, mut condition: F) -> Self
    where
        F: FnMut(&mut T) -> bool,
    {
        while condition(&mut *self.guard) {
            self = self.wait();
        }
        self
    }

    /// Wakes at most one waiter.
    pub fn notify(&self) {
        self.cond.notify_one();
    }

    pub fn notify_all(&self) {
        self.cond.notify_all();
    }
}

impl<T> Deref for MonitorGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for MonitorGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
