//! Time source for the pump.
//!
//! The scheduler never reads the system time directly; it asks a [`Clock`]
//! for "now" and asks it to wait until the next due event. [`SystemClock`]
//! really sleeps, [`VirtualClock`] jumps, so tests and batch runs advance
//! hours of pump time instantly.

use chrono::{DateTime, Duration, Utc};
use std::cell::Cell;
use std::rc::Rc;

pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
    /// Block (or jump) until `deadline`. Deadlines in the past return at once.
    fn sleep_until(&self, deadline: DateTime<Utc>);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep_until(&self, deadline: DateTime<Utc>) {
        if let Ok(wait) = (deadline - Utc::now()).to_std() {
            std::thread::sleep(wait);
        }
    }
}

/// Steppable clock. Clones share the same instant, so a test can keep a
/// handle while the pump owns another.
#[derive(Debug, Clone)]
pub struct VirtualClock {
    now: Rc<Cell<DateTime<Utc>>>,
}

impl VirtualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Rc::new(Cell::new(start)),
        }
    }

    /// Midnight, 1 March 2024 UTC. Used by tests that need fixed times of day.
    pub fn at_epoch() -> Self {
        Self::new(DateTime::from_timestamp(1_709_251_200, 0).unwrap_or_default())
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }

    pub fn set(&self, to: DateTime<Utc>) {
        self.now.set(to);
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.get()
    }

    fn sleep_until(&self, deadline: DateTime<Utc>) {
        if deadline > self.now.get() {
            self.now.set(deadline);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_clock_shared_between_clones() {
        let clock = VirtualClock::at_epoch();
        let handle = clock.clone();
        let start = clock.now();
        handle.advance(Duration::minutes(5));
        assert_eq!(clock.now() - start, Duration::minutes(5));
    }

    #[test]
    fn test_virtual_clock_never_goes_backwards() {
        let clock = VirtualClock::at_epoch();
        let start = clock.now();
        clock.sleep_until(start - Duration::hours(1));
        assert_eq!(clock.now(), start);
        clock.sleep_until(start + Duration::seconds(30));
        assert_eq!(clock.now(), start + Duration::seconds(30));
    }
}
