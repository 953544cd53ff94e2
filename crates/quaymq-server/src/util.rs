//! Small helpers shared by connection threads.

use std::time::{Duration, Instant};

/// Accumulates events and reports the running total at most once per
/// interval, so a flood of identical warnings becomes one periodic line.
#[derive(Debug)]
pub struct ThrottledCounter {
    pending: u64,
    last_report: Option<Instant>,
    interval: Duration,
}

impl ThrottledCounter {
    pub fn new(interval: Duration) -> Self {
        Self {
            pending: 0,
            last_report: None,
            interval,
        }
    }

    /// Count one event. Returns the number of events since the last report
    /// when a report is due. The first event is always reported.
    pub fn record(&mut self, now: Instant) -> Option<u64> {
        self.pending += 1;
        let due = match self.last_report {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        };
        if !due {
            return None;
        }
        self.last_report = Some(now);
        Some(std::mem::take(&mut self.pending))
    }

    /// Events recorded but not yet reported.
    pub fn pending(&self) -> u64 {
        self.pending
    }
}

/// Earliest of two optional deadlines.
pub fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reports_first_then_throttles() {
        let start = Instant::now();
        let mut counter = ThrottledCounter::new(Duration::from_secs(10));
        assert_eq!(counter.record(start), Some(1));
        assert_eq!(counter.record(start + Duration::from_secs(1)), None);
        assert_eq!(counter.record(start + Duration::from_secs(2)), None);
        assert_eq!(counter.pending(), 2);
        assert_eq!(counter.record(start + Duration::from_secs(10)), Some(3));
        assert_eq!(counter.pending(), 0);
    }

    #[test]
    fn test_earliest() {
        let now = Instant::now();
        let later = now + Duration::from_secs(1);
        assert_eq!(earliest(Some(later), Some(now)), Some(now));
        assert_eq!(earliest(None, Some(later)), Some(later));
        assert_eq!(earliest(Some(now), None), Some(now));
        assert_eq!(earliest(None, None), None);
    }
}
