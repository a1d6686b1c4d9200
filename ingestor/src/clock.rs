use std::{
    fmt,
    time::{Duration, SystemTime},
};

use parking_lot::RwLock;

/// Wall clock used for HA lease bookkeeping.
pub trait Clock: fmt::Debug + Send + Sync {
    fn now(&self) -> SystemTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct MockClock {
    now: RwLock<SystemTime>,
}

impl Clock for MockClock {
    fn now(&self) -> SystemTime {
        *self.now.read()
    }
}

impl MockClock {
    pub fn with_time(time: SystemTime) -> Self {
        Self {
            now: RwLock::new(time),
        }
    }

    pub fn new() -> Self {
        Self::with_time(SystemTime::now())
    }

    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.write();
        *now += duration;
    }

    pub fn set_time(&self, time: SystemTime) {
        *self.now.write() = time;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}
