//! Module providing epoch-millisecond clocks.

use std::{
    cell::Cell,
    rc::Rc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// A source of wall-clock time in milliseconds since the unix epoch.
pub trait TimeSource {
    /// Returns the current time in milliseconds since the unix epoch.
    fn current_millis(&self) -> u64;
}

/// [`TimeSource`] reading [`SystemTime::now`].
#[derive(Default, Clone, Copy, Debug)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn current_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default()
    }
}

/// A manually driven [`TimeSource`]. Clones share the same instant.
#[derive(Default, Clone, Debug)]
pub struct ManualClock {
    millis: Rc<Cell<u64>>,
}

impl ManualClock {
    pub fn starting_at(millis: u64) -> Self {
        Self {
            millis: Rc::new(Cell::new(millis)),
        }
    }

    pub fn set(&self, millis: u64) {
        self.millis.set(millis);
    }

    pub fn advance(&self, duration: Duration) {
        self.millis
            .set(self.millis.get() + duration.as_millis() as u64);
    }
}

impl TimeSource for ManualClock {
    fn current_millis(&self) -> u64 {
        self.millis.get()
    }
}
