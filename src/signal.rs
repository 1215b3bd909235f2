//! A settable, waitable flag shared between threads.
//!
//! Every "is X enabled / has Y happened" toggle in the pipeline is a
//! [`Signal`]. Waiting is always bounded by a timeout, so a thread parked on a
//! signal still notices a stop request within one polling interval.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A `Signal` behind an `Arc`, the form it is handed to components in.
pub type SharedSignal = Arc<Signal>;

/// A boolean flag with blocking, timed waits for it to become set.
#[derive(Debug, Default)]
pub struct Signal {
    state: Mutex<bool>,
    changed: Condvar,
}

impl Signal {
    /// Instantiates a cleared signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Instantiates a cleared signal ready to be shared.
    pub fn shared() -> SharedSignal {
        Arc::new(Self::new())
    }

    /// Sets the flag and wakes every waiter.
    pub fn set(&self) {
        let mut state = self.state.lock();
        *state = true;
        self.changed.notify_all();
    }

    /// Clears the flag.
    pub fn clear(&self) {
        *self.state.lock() = false;
    }

    /// Non-blocking probe.
    pub fn is_set(&self) -> bool {
        *self.state.lock()
    }

    /// Blocks until the flag is set or `timeout` elapses. Returns whether the
    /// flag is set on return.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !*state {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        *state
    }
}
