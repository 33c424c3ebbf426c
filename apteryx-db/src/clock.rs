//! The write timestamp source.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Strictly increasing microsecond timestamps.
///
/// Follows the wall clock while it moves forward; two allocations in the
/// same microsecond (or a clock step backwards) are disambiguated by
/// incrementing, so no two writes ever share a timestamp.
#[derive(Default)]
pub struct Clock {
    last: AtomicU64,
}

impl Clock {
    pub fn new() -> Self {
        Clock::default()
    }

    pub fn now_us(&self) -> u64 {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);

        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = wall.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strictly_increasing() {
        let clock = Clock::new();
        let mut last = 0;
        for _ in 0..10_000 {
            let ts = clock.now_us();
            assert!(ts > last);
            last = ts;
        }
    }

    #[test]
    fn concurrent_allocations_are_unique() {
        use std::collections::HashSet;
        use std::sync::Arc;

        let clock = Arc::new(Clock::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let clock = clock.clone();
            handles.push(std::thread::spawn(move || {
                (0..1000).map(|_| clock.now_us()).collect::<Vec<_>>()
            }));
        }
        let mut seen = HashSet::new();
        for handle in handles {
            for ts in handle.join().unwrap() {
                assert!(seen.insert(ts), "duplicate timestamp {ts}");
            }
        }
    }
}
