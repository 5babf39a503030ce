//! Adaptive timing of discovery rounds.
//!
//! A sparse table is filled aggressively, a populated one only maintained.

use std::time::Duration;

use tokio::time::Instant;

/// Interval while fewer than one bucket's worth of nodes are bonded.
pub const FAST_DISCOVERY_INTERVAL: Duration = Duration::from_millis(100);

/// Interval while the table is still filling up.
pub const MEDIUM_DISCOVERY_INTERVAL: Duration = Duration::from_secs(1);

/// How many buckets' worth of bonded nodes end the medium phase.
const MEDIUM_PHASE_BUCKETS: usize = 4;

#[derive(Debug, Clone, Copy)]
pub struct DiscoverySchedule {
    bucket_size: usize,
    steady_interval: Duration,
    min_spacing: Duration,
}

impl DiscoverySchedule {
    pub fn new(bucket_size: usize, steady_interval: Duration, min_spacing: Duration) -> Self {
        Self {
            bucket_size,
            steady_interval,
            min_spacing,
        }
    }

    pub fn interval_for(&self, bonded: usize) -> Duration {
        if bonded < self.bucket_size {
            FAST_DISCOVERY_INTERVAL
        } else if bonded < self.bucket_size.saturating_mul(MEDIUM_PHASE_BUCKETS) {
            MEDIUM_DISCOVERY_INTERVAL
        } else {
            self.steady_interval
        }
    }

    /// Start of the next round: one interval after the previous scheduled
    /// start, but never sooner than `min_spacing` after the previous round
    /// finished, so a slow round does not cause back-to-back rounds.
    pub fn next_tick(&self, scheduled: Instant, finished: Instant, interval: Duration) -> Instant {
        (scheduled + interval).max(finished + self.min_spacing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule() -> DiscoverySchedule {
        DiscoverySchedule::new(16, Duration::from_secs(30), Duration::from_millis(50))
    }

    #[test]
    fn test_interval_phases() {
        let schedule = schedule();
        assert_eq!(schedule.interval_for(0), FAST_DISCOVERY_INTERVAL);
        assert_eq!(schedule.interval_for(15), FAST_DISCOVERY_INTERVAL);
        assert_eq!(schedule.interval_for(16), MEDIUM_DISCOVERY_INTERVAL);
        assert_eq!(schedule.interval_for(63), MEDIUM_DISCOVERY_INTERVAL);
        assert_eq!(schedule.interval_for(64), Duration::from_secs(30));
    }

    #[test]
    fn test_next_tick_keeps_cadence() {
        let schedule = schedule();
        let start = Instant::now();
        let finished = start + Duration::from_millis(10);

        assert_eq!(
            schedule.next_tick(start, finished, Duration::from_secs(1)),
            start + Duration::from_secs(1)
        );
    }

    #[test]
    fn test_next_tick_respects_min_spacing() {
        let schedule = schedule();
        let start = Instant::now();
        // The round overran its interval
        let finished = start + Duration::from_millis(500);

        assert_eq!(
            schedule.next_tick(start, finished, FAST_DISCOVERY_INTERVAL),
            finished + Duration::from_millis(50)
        );
    }
}
