//! Per-device "last seen" clock.
//!
//! The clock stores its last-seen mark as nanoseconds elapsed since the
//! device's creation instant, in a single atomic. `touch()` is lock-free and
//! uses `fetch_max`, so concurrent refreshes from several I/O workers can never
//! move the mark backwards.
//!
//! All instants come from `tokio::time::Instant`, which follows tokio's paused
//! clock in tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

/// Monotonic last-seen timestamp holder.
#[derive(Debug)]
pub struct ExpiryClock {
    /// Creation instant, also the zero point of `last_seen_nanos`.
    origin: Instant,

    /// Nanoseconds from `origin` to the latest touch.
    last_seen_nanos: AtomicU64,
}

impl ExpiryClock {
    /// Creates a clock whose creation and last-seen marks are both "now".
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    /// Creates a clock anchored at an explicit instant.
    pub fn starting_at(origin: Instant) -> Self {
        Self {
            origin,
            last_seen_nanos: AtomicU64::new(0),
        }
    }

    /// Records activity at the current instant.
    pub fn touch(&self) {
        self.touch_at(Instant::now());
    }

    /// Records activity at `at`. Instants older than the current mark are ignored.
    pub fn touch_at(&self, at: Instant) {
        let nanos = duration_to_nanos(at.saturating_duration_since(self.origin));
        self.last_seen_nanos.fetch_max(nanos, Ordering::AcqRel);
    }

    /// The instant the clock was created.
    pub fn created_at(&self) -> Instant {
        self.origin
    }

    /// The instant of the most recent touch (creation if never touched).
    pub fn last_seen(&self) -> Instant {
        self.origin + Duration::from_nanos(self.last_seen_nanos.load(Ordering::Acquire))
    }

    /// Silence measured against `now`. Zero if `now` precedes the last touch.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen())
    }

    /// True once the silence strictly exceeds `expire_after`.
    pub fn is_expired(&self, now: Instant, expire_after: Duration) -> bool {
        self.idle_for(now) > expire_after
    }
}

impl Default for ExpiryClock {
    fn default() -> Self {
        Self::new()
    }
}

fn duration_to_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_new_clock_is_fresh() {
        let clock = ExpiryClock::new();
        assert_eq!(clock.last_seen(), clock.created_at());
        assert_eq!(clock.idle_for(Instant::now()), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_refreshes_last_seen() {
        let clock = ExpiryClock::new();
        tokio::time::advance(Duration::from_millis(750)).await;
        clock.touch();

        assert_eq!(
            clock.last_seen().duration_since(clock.created_at()),
            Duration::from_millis(750)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_never_moves_backwards() {
        let origin = Instant::now();
        let clock = ExpiryClock::starting_at(origin);

        clock.touch_at(origin + Duration::from_secs(5));
        clock.touch_at(origin + Duration::from_secs(2));

        assert_eq!(clock.last_seen(), origin + Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_is_strict() {
        let origin = Instant::now();
        let clock = ExpiryClock::starting_at(origin);
        let deadline = Duration::from_millis(1000);

        assert!(!clock.is_expired(origin + Duration::from_millis(1000), deadline));
        assert!(clock.is_expired(origin + Duration::from_millis(1001), deadline));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_for_saturates_when_now_is_stale() {
        let origin = Instant::now();
        let clock = ExpiryClock::starting_at(origin);
        clock.touch_at(origin + Duration::from_secs(3));

        assert_eq!(clock.idle_for(origin + Duration::from_secs(1)), Duration::ZERO);
    }
}
