//! Monotonic time sources for worker activity tracking.
//!
//! Dispatchers sample a [`Clock`] around every demand they execute and
//! every wait on an empty queue; the runtime-stats controller publishes the
//! accumulated working/waiting durations. Readings are nanoseconds since an
//! arbitrary per-clock origin, so only differences between two readings of
//! the same clock instance are meaningful.

use std::time::Instant;

/// A source of monotonic nanosecond readings.
pub trait Clock: Send + Sync + 'static {
    /// Nanoseconds elapsed since this clock's origin. Never decreases.
    fn now(&self) -> u64;
}

/// Default clock backed by `std::time::Instant`, anchored at construction.
///
/// Accurate and portable; the per-reading cost is visible only when
/// handlers are in the sub-microsecond range.
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

/// A clock reading the CPU's Time-Stamp Counter via the `quanta` crate.
///
/// Worth choosing when activity tracking is enabled on a hot dispatcher:
/// two readings bracket every demand, and the TSC keeps that overhead out
/// of the measured numbers.
#[derive(Debug, Clone)]
pub struct QuantaClock {
    clock: quanta::Clock,
    origin: quanta::Instant,
}

impl Default for QuantaClock {
    fn default() -> Self {
        let clock = quanta::Clock::new();
        let origin = clock.now();
        Self { clock, origin }
    }
}

impl QuantaClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for QuantaClock {
    fn now(&self) -> u64 {
        let delta = self.clock.now().duration_since(self.origin);
        u64::try_from(delta.as_nanos()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readings_do_not_go_backwards() {
        let clocks: Vec<Box<dyn Clock>> = vec![
            Box::new(MonotonicClock::new()),
            Box::new(QuantaClock::new()),
        ];
        for clock in clocks {
            let a = clock.now();
            std::thread::sleep(std::time::Duration::from_millis(2));
            let b = clock.now();
            assert!(b >= a);
            assert!(b - a >= 1_000_000);
        }
    }
}
