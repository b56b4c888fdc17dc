use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// One-way cancellation signal shared between the threads of a trial.
///
/// Waiters block on a condition variable instead of polling, so a cancel is
/// observed immediately.
#[derive(Debug, Default)]
pub struct CancelToken {
    cancelled: Mutex<bool>,
    cond: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let mut cancelled = self.cancelled.lock();
        if !*cancelled {
            *cancelled = true;
            self.cond.notify_all();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.lock()
    }

    /// Blocks for at most `timeout`. Returns `true` if the token was
    /// cancelled before or during the wait.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut cancelled = self.cancelled.lock();
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            while !*cancelled {
                self.cond.wait(&mut cancelled);
            }
            return true;
        };
        while !*cancelled {
            if self.cond.wait_until(&mut cancelled, deadline).timed_out() {
                break;
            }
        }
        *cancelled
    }

    /// Returns a guard that cancels the token when dropped, including
    /// during unwinding.
    pub fn cancel_on_drop(&self) -> CancelGuard<'_> {
        CancelGuard { token: self }
    }
}

#[must_use = "the token is cancelled as soon as the guard is dropped"]
pub struct CancelGuard<'a> {
    token: &'a CancelToken,
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
