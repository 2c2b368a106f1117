use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic scalar clock used to timestamp snapshots. `update_max`
/// advances the clock to at least the given value.
#[derive(Debug, Default)]
pub struct ScalarClock(AtomicU64);

impl ScalarClock {
    pub fn new(value: u64) -> ScalarClock {
        ScalarClock(AtomicU64::new(value))
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Advance by one and return the new value.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Advance to `other` if it is ahead; returns the resulting value.
    pub fn update_max(&self, other: u64) -> u64 {
        let mut cur = self.0.load(Ordering::Acquire);
        loop {
            if other <= cur {
                return cur;
            }
            match self
                .0
                .compare_exchange(cur, other, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return other,
                Err(seen) => cur = seen,
            }
        }
    }

    pub fn less(&self, other: u64) -> bool {
        self.value() < other
    }

    pub fn less_equal(&self, other: u64) -> bool {
        self.value() <= other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_clock() {
        let clock = ScalarClock::new(10);
        assert_eq!(clock.update_max(5), 10);
        assert_eq!(clock.update_max(20), 20);
        assert!(!clock.less(20));
        assert!(clock.less_equal(20));
        assert!(clock.less(21));
        assert_eq!(clock.next(), 21);
    }
}
