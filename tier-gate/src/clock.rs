use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// Source of wall-clock time.
///
/// Window buckets and cache ages are computed from time since the Unix epoch so
/// that every instance sharing a store agrees on bucket boundaries.
pub trait Clock: Debug + Send + Sync {
    /// Time elapsed since the Unix epoch.
    fn now(&self) -> Duration;
}

/// System clock backed by `SystemTime::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
    }
}

/// A clock that only moves when told to, with millisecond resolution.
///
/// Clones share the same time, so advancing one advances all of them.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    millis: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start: Duration) -> Self {
        Self {
            millis: Arc::new(AtomicU64::new(start.as_millis() as u64)),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.millis
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, to: Duration) {
        self.millis.store(to.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_millis(self.millis.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_is_shared_between_clones() {
        let clock = ManualClock::new(Duration::from_secs(100));
        let other = clock.clone();

        other.advance(Duration::from_millis(1500));
        assert_eq!(clock.now(), Duration::from_millis(101_500));

        clock.set(Duration::from_secs(7));
        assert_eq!(other.now(), Duration::from_secs(7));
    }

    #[test]
    fn system_clock_is_past_the_epoch() {
        assert!(SystemClock.now() > Duration::from_secs(1_600_000_000));
    }
}
