//! Clock abstraction for testable scheduling and signing.
//!
//! Delivery timing is pervasive here: signatures embed a unix timestamp,
//! retries are scheduled at absolute times, and the scheduler polls on an
//! interval. Injecting a [`Clock`] lets tests drive all of it
//! deterministically instead of sleeping.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, Utc};

/// Time source used by the dispatcher and scheduler.
///
/// Production code uses [`RealClock`]; tests inject [`TestClock`] and advance
/// it manually to cross retry deadlines without waiting.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current instant for latency measurements.
    fn now(&self) -> Instant;

    /// Current wall-clock time.
    fn now_system(&self) -> SystemTime;

    /// Sleeps for the given duration.
    ///
    /// Maps to `tokio::time::sleep` in production; the test clock advances
    /// virtual time and yields instead.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Current wall-clock time as a chrono UTC timestamp, the form stored on
    /// delivery rows.
    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.now_system())
    }

    /// Current unix timestamp in seconds, the form embedded in signatures.
    fn unix_timestamp(&self) -> i64 {
        self.now_utc().timestamp()
    }
}

/// System-time clock used in production.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Manually advanced clock for deterministic tests.
///
/// Monotonic and wall-clock time are tracked separately: [`advance`] moves
/// both forward, [`jump_to`] can move wall-clock time in either direction
/// while monotonic time only ever increases.
///
/// [`advance`]: TestClock::advance
/// [`jump_to`]: TestClock::jump_to
#[derive(Debug, Clone)]
pub struct TestClock {
    /// Nanoseconds of monotonic time since clock creation.
    monotonic_ns: Arc<AtomicU64>,
    /// Wall-clock time as nanoseconds since UNIX_EPOCH.
    wall_ns: Arc<AtomicU64>,
    /// Anchor for converting monotonic nanoseconds back to an Instant.
    base_instant: Instant,
}

impl TestClock {
    /// Creates a test clock starting at the current wall-clock time.
    pub fn new() -> Self {
        Self::with_start_time(SystemTime::now())
    }

    /// Creates a test clock starting at a specific wall-clock time.
    pub fn with_start_time(start: SystemTime) -> Self {
        let since_epoch = start.duration_since(UNIX_EPOCH).unwrap_or_default();

        Self {
            monotonic_ns: Arc::new(AtomicU64::new(0)),
            wall_ns: Arc::new(AtomicU64::new(saturating_ns(since_epoch))),
            base_instant: Instant::now(),
        }
    }

    /// Advances both monotonic and wall-clock time.
    pub fn advance(&self, duration: Duration) {
        let ns = saturating_ns(duration);
        self.monotonic_ns.fetch_add(ns, Ordering::AcqRel);
        self.wall_ns.fetch_add(ns, Ordering::AcqRel);
    }

    /// Moves wall-clock time to `time`.
    ///
    /// Forward jumps also advance monotonic time; backward jumps move only
    /// the wall clock, since monotonic time cannot regress.
    pub fn jump_to(&self, time: SystemTime) {
        let target_ns = saturating_ns(time.duration_since(UNIX_EPOCH).unwrap_or_default());
        let current_ns = self.wall_ns.load(Ordering::Acquire);

        if target_ns > current_ns {
            self.advance(Duration::from_nanos(target_ns - current_ns));
        } else {
            self.wall_ns.store(target_ns, Ordering::Release);
        }
    }

    /// Monotonic time elapsed since clock creation.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.monotonic_ns.load(Ordering::Acquire))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base_instant + self.elapsed()
    }

    fn now_system(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_nanos(self.wall_ns.load(Ordering::Acquire))
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        // Virtual sleep: advance the clock, then yield so other tasks run.
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}

fn saturating_ns(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos().min(u128::from(u64::MAX))).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_moves_monotonic_time() {
        let clock = TestClock::new();
        let start = clock.now();

        clock.advance(Duration::from_secs(10));

        assert_eq!(clock.now().duration_since(start), Duration::from_secs(10));
    }

    #[test]
    fn advance_moves_wall_clock_in_step() {
        let start = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let clock = TestClock::with_start_time(start);

        assert_eq!(clock.now_system(), start);
        clock.advance(Duration::from_secs(60));
        assert_eq!(clock.now_system(), start + Duration::from_secs(60));
    }

    #[test]
    fn unix_timestamp_reflects_wall_clock() {
        let clock =
            TestClock::with_start_time(UNIX_EPOCH + Duration::from_secs(1_700_000_000));

        assert_eq!(clock.unix_timestamp(), 1_700_000_000);

        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.unix_timestamp(), 1_700_000_090);
    }

    #[test]
    fn jump_backward_leaves_monotonic_time_alone() {
        let clock =
            TestClock::with_start_time(UNIX_EPOCH + Duration::from_secs(2_000));
        clock.advance(Duration::from_secs(100));

        clock.jump_to(UNIX_EPOCH + Duration::from_secs(1_500));

        assert_eq!(clock.now_system(), UNIX_EPOCH + Duration::from_secs(1_500));
        assert_eq!(clock.elapsed(), Duration::from_secs(100));
    }

    #[test]
    fn jump_forward_advances_both() {
        let clock = TestClock::with_start_time(UNIX_EPOCH + Duration::from_secs(1_000));

        clock.jump_to(UNIX_EPOCH + Duration::from_secs(4_600));

        assert_eq!(clock.now_system(), UNIX_EPOCH + Duration::from_secs(4_600));
        assert_eq!(clock.elapsed(), Duration::from_secs(3_600));
    }

    #[tokio::test]
    async fn sleep_advances_virtual_time() {
        let clock = TestClock::new();
        let start = clock.now();

        clock.sleep(Duration::from_secs(5)).await;

        assert_eq!(clock.now().duration_since(start), Duration::from_secs(5));
    }
}
