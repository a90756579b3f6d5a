//! Time-of-day source for the late/on-time decision.

use chrono::NaiveTime;
use std::sync::{Arc, Mutex};

pub trait Clock {
    /// Current local time of day.
    fn now(&self) -> NaiveTime;
}

impl<C: Clock + ?Sized> Clock for Box<C> {
    fn now(&self) -> NaiveTime {
        (**self).now()
    }
}

/// Local wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveTime {
        chrono::Local::now().time()
    }
}

/// A clock that reads whatever time it was last set to.
///
/// Clones share the same time, so a test (or a replay run) can keep a
/// handle and move the clock after handing a copy to the pipeline.
#[derive(Debug, Clone)]
pub struct FixedClock {
    time: Arc<Mutex<NaiveTime>>,
}

impl FixedClock {
    pub fn new(time: NaiveTime) -> Self {
        Self {
            time: Arc::new(Mutex::new(time)),
        }
    }

    pub fn set(&self, time: NaiveTime) {
        let mut guard = self.time.lock().unwrap_or_else(|e| e.into_inner());
        *guard = time;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> NaiveTime {
        *self.time.lock().unwrap_or_else(|e| e.into_inner())
    }
}
