//! Monotonic time source and the bounded polling primitive
//!
//! Every wait in the driver goes through [`poll_until`], which samples a
//! condition, sleeps a fixed interval and gives up at a deadline. The clock is
//! a trait so tests can run the same code against [`ManualClock`], where
//! sleeping just advances virtual time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::Result;

/// Monotonic clock with a blocking sleep
pub trait Clock: Clone {
    /// Time elapsed since an arbitrary fixed origin
    fn now(&self) -> Duration;

    fn sleep(&self, duration: Duration);
}

/// Wall-clock implementation backed by `Instant` and `thread::sleep`
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Virtual clock shared between clones; `sleep` advances it instantly
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, duration: Duration) {
        self.nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// Fixed point in time after which a wait is abandoned
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    start: Duration,
    timeout: Duration,
}

impl Deadline {
    pub fn after<C: Clock>(clock: &C, timeout: Duration) -> Self {
        Self {
            start: clock.now(),
            timeout,
        }
    }

    pub fn elapsed<C: Clock>(&self, clock: &C) -> Duration {
        clock.now().saturating_sub(self.start)
    }

    pub fn remaining<C: Clock>(&self, clock: &C) -> Duration {
        self.timeout.saturating_sub(self.elapsed(clock))
    }

    pub fn expired<C: Clock>(&self, clock: &C) -> bool {
        self.elapsed(clock) >= self.timeout
    }
}

// Zero intervals would spin forever on a virtual clock
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Samples `probe` until it yields a value or `timeout` elapses
///
/// The probe runs at least once, even with a zero timeout. Errors from the
/// probe abort the wait immediately. Returns `Ok(None)` on expiry.
pub fn poll_until<C, T, F>(
    clock: &C,
    timeout: Duration,
    interval: Duration,
    mut probe: F,
) -> Result<Option<T>>
where
    C: Clock,
    F: FnMut() -> Result<Option<T>>,
{
    let deadline = Deadline::after(clock, timeout);
    let step = interval.max(MIN_POLL_INTERVAL);
    loop {
        if let Some(value) = probe()? {
            return Ok(Some(value));
        }
        if deadline.expired(clock) {
            return Ok(None);
        }
        clock.sleep(step.min(deadline.remaining(clock)));
    }
}
