//! Binary event used for the coordinator/worker handshake.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A settable flag others can block on. The scheduling protocol keeps one
/// `ready` and one `done` event per worker with strictly alternating
/// ownership, so there is never more than one waiter.
#[derive(Default)]
pub(crate) struct Event {
    state: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let mut state = self.state.lock().unwrap();
        *state = true;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        *self.state.lock().unwrap() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.state.lock().unwrap()
    }

    pub fn wait(&self) {
        let mut state = self.state.lock().unwrap();
        while !*state {
            state = self.cond.wait(state).unwrap();
        }
    }

    /// Waits until the event is set or the timeout expires; reports whether
    /// the event was set.
    pub fn timed_wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        while !*state {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = self.cond.wait_timeout(state, deadline - now).unwrap();
            state = next;
        }
        true
    }
}
