//! Store write lock
//!
//! A single exclusive lock that, unlike a plain mutex, can report whether
//! other writers are queued on it. Transactions use that to decide whether a
//! yield point is worth taking.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use sharedprefs_core::{Error, Result};

#[derive(Debug, Default)]
struct LockState {
    held: bool,
    waiters: usize,
    shutdown: bool,
}

/// Exclusive write lock with contention tracking
#[derive(Debug, Default)]
pub struct WriteLock {
    state: Mutex<LockState>,
    released: Condvar,
}

impl WriteLock {
    /// Create an unlocked lock
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock, waiting at most `wait` when given
    ///
    /// # Errors
    ///
    /// `Interrupted` when the wait times out or the lock is shut down.
    pub fn acquire(&self, wait: Option<Duration>) -> Result<()> {
        let deadline = wait.map(|w| Instant::now() + w);
        let mut state = self.state.lock();
        state.waiters += 1;

        while state.held && !state.shutdown {
            match deadline {
                Some(deadline) => {
                    if self.released.wait_until(&mut state, deadline).timed_out() && state.held {
                        state.waiters -= 1;
                        return Err(Error::Interrupted(
                            "timed out waiting for the store write lock".to_string(),
                        ));
                    }
                }
                None => self.released.wait(&mut state),
            }
        }

        state.waiters -= 1;
        if state.shutdown {
            return Err(Error::Interrupted("store is shutting down".to_string()));
        }
        state.held = true;
        Ok(())
    }

    /// Release the lock and wake waiters
    pub fn release(&self) {
        let mut state = self.state.lock();
        state.held = false;
        drop(state);
        self.released.notify_all();
    }

    /// True if at least one thread is waiting for the lock
    pub fn is_contended(&self) -> bool {
        self.state.lock().waiters > 0
    }

    /// True while some transaction holds the lock
    pub fn is_held(&self) -> bool {
        self.state.lock().held
    }

    /// Fail every current and future waiter with `Interrupted`
    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.released.notify_all();
    }
}
