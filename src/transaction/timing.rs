//! Transaction timing accounting
//!
//! Tracks how long a transaction has been open, how much of that time the
//! session was checked out to an operation (active) versus stashed
//! (inactive), and how long commit took. Driven by a monotonic
//! [`TickSource`] so tests can control time.

use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

/// Monotonic reading from a [`TickSource`], measured from its origin.
pub type Tick = Duration;

/// Monotonic tick source.
pub trait TickSource: Send + Sync {
    fn ticks(&self) -> Tick;
}

/// Tick source backed by the process monotonic clock.
#[derive(Debug)]
pub struct SystemTickSource {
    origin: Instant,
}

impl SystemTickSource {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemTickSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TickSource for SystemTickSource {
    fn ticks(&self) -> Tick {
        self.origin.elapsed()
    }
}

/// Active/inactive duration accounting for one transaction.
///
/// A transaction becomes active when an operation checks the session out
/// and inactive when the session is stashed. Commit start is stamped once,
/// on the first commit initiation, so retried commits measure the full
/// decision window.
#[derive(Debug, Clone, Default)]
pub struct TimingStats {
    /// Tick at which the transaction first became active
    pub start_ticks: Option<Tick>,
    /// Wall-clock instant of the transaction start, for reporting
    pub start_wall_clock: Option<DateTime<Utc>>,
    /// Tick of the first commit initiation
    pub commit_start_ticks: Option<Tick>,
    /// Wall-clock instant of the first commit initiation
    pub commit_start_wall_clock: Option<DateTime<Utc>>,
    /// Tick at which the transaction's outcome became known
    pub end_ticks: Option<Tick>,
    /// Accumulated active time over completed active periods
    pub time_active: Duration,
    /// Tick at which the current active period began, if active
    pub last_active_start: Option<Tick>,
}

impl TimingStats {
    /// Total time the transaction has been (or was) open.
    pub fn duration(&self, current: Tick) -> Duration {
        let Some(start) = self.start_ticks else {
            debug_assert!(false, "timing queried before the transaction started");
            return Duration::ZERO;
        };
        self.end_ticks.unwrap_or(current).saturating_sub(start)
    }

    /// Time since commit was initiated, or the full commit duration once
    /// the transaction ended.
    pub fn commit_duration(&self, current: Tick) -> Duration {
        let Some(commit_start) = self.commit_start_ticks else {
            debug_assert!(false, "commit duration queried before commit started");
            return Duration::ZERO;
        };
        self.end_ticks
            .unwrap_or(current)
            .saturating_sub(commit_start)
    }

    /// Time the session spent checked out for this transaction.
    pub fn time_active(&self, current: Tick) -> Duration {
        match self.last_active_start {
            Some(active_start) => self.time_active + current.saturating_sub(active_start),
            None => self.time_active,
        }
    }

    /// Time the transaction was open but the session stashed.
    pub fn time_inactive(&self, current: Tick) -> Duration {
        self.duration(current)
            .saturating_sub(self.time_active(current))
    }

    pub fn has_ended(&self) -> bool {
        self.end_ticks.is_some()
    }

    /// Begin an active period. No-op if the transaction already ended or
    /// is already active. The first activation stamps the start instant.
    pub fn try_set_active(&mut self, current: Tick) {
        if self.end_ticks.is_some() || self.last_active_start.is_some() {
            return;
        }
        if self.start_ticks.is_none() {
            self.start_ticks = Some(current);
            self.start_wall_clock = Some(Utc::now());
        }
        self.last_active_start = Some(current);
    }

    /// End the current active period. No-op if the transaction already
    /// ended or is not active; error paths may stash a session twice.
    pub fn try_set_inactive(&mut self, current: Tick) {
        if self.end_ticks.is_some() {
            return;
        }
        let Some(active_start) = self.last_active_start.take() else {
            return;
        };
        self.time_active += current.saturating_sub(active_start);
    }

    /// Stamp commit initiation. Only the first initiation counts.
    pub fn try_set_commit_start(&mut self, current: Tick) {
        if self.commit_start_ticks.is_some() {
            return;
        }
        self.commit_start_ticks = Some(current);
        self.commit_start_wall_clock = Some(Utc::now());
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Manually driven tick source for deterministic timing tests.
    #[derive(Debug, Default)]
    pub struct ManualTickSource {
        micros: AtomicU64,
    }

    impl ManualTickSource {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn advance(&self, by: Duration) {
            self.micros
                .fetch_add(by.as_micros() as u64, Ordering::SeqCst);
        }
    }

    impl TickSource for ManualTickSource {
        fn ticks(&self) -> Tick {
            Duration::from_micros(self.micros.load(Ordering::SeqCst))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ManualTickSource;
    use super::*;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn active_and_inactive_time_split_the_open_window() {
        let ticks = ManualTickSource::new();
        let mut stats = TimingStats::default();

        stats.try_set_active(ticks.ticks());
        ticks.advance(ms(10));
        stats.try_set_inactive(ticks.ticks());
        ticks.advance(ms(30));
        stats.try_set_active(ticks.ticks());
        ticks.advance(ms(5));

        let now = ticks.ticks();
        assert_eq!(stats.duration(now), ms(45));
        assert_eq!(stats.time_active(now), ms(15));
        assert_eq!(stats.time_inactive(now), ms(30));
    }

    #[test]
    fn double_stash_is_harmless() {
        let ticks = ManualTickSource::new();
        let mut stats = TimingStats::default();

        stats.try_set_active(ticks.ticks());
        ticks.advance(ms(7));
        stats.try_set_inactive(ticks.ticks());
        stats.try_set_inactive(ticks.ticks());
        assert_eq!(stats.time_active(ticks.ticks()), ms(7));
    }

    #[test]
    fn commit_start_is_stamped_once() {
        let ticks = ManualTickSource::new();
        let mut stats = TimingStats::default();

        stats.try_set_active(ticks.ticks());
        ticks.advance(ms(20));
        stats.try_set_commit_start(ticks.ticks());
        ticks.advance(ms(4));
        stats.try_set_commit_start(ticks.ticks());
        ticks.advance(ms(1));

        assert_eq!(stats.commit_duration(ticks.ticks()), ms(5));
    }

    #[test]
    fn ended_transaction_freezes_durations() {
        let ticks = ManualTickSource::new();
        let mut stats = TimingStats::default();

        stats.try_set_active(ticks.ticks());
        ticks.advance(ms(12));
        stats.try_set_inactive(ticks.ticks());
        stats.end_ticks = Some(ticks.ticks());
        ticks.advance(ms(100));

        let now = ticks.ticks();
        assert_eq!(stats.duration(now), ms(12));
        stats.try_set_active(now);
        assert!(stats.last_active_start.is_none());
    }
}
