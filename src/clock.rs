use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock abstraction injected into every component that needs `now()`.
///
/// Mirrors the teacher's pattern of passing collaborators into constructors
/// (`BackupManager::new(config, retention_policy)`) rather than reaching for
/// global timers; it lets tests drive rotation/health/lock-expiry logic
/// deterministically instead of racing real time.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;

    fn now_millis(&self) -> u64 {
        self.now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Production clock backed by `SystemTime::now()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Test clock that can be advanced manually and is safe to share across threads.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new(start: SystemTime) -> Self {
        let millis = start
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self {
            millis: AtomicU64::new(millis),
        }
    }

    pub fn advance(&self, delta_millis: u64) {
        self.millis.fetch_add(delta_millis, Ordering::SeqCst);
    }

    pub fn set_millis(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        UNIX_EPOCH + std::time::Duration::from_millis(self.millis.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(UNIX_EPOCH);
        assert_eq!(clock.now_millis(), 0);
        clock.advance(1_000);
        assert_eq!(clock.now_millis(), 1_000);
    }
}
