//! Throttled percentage reporting for byte transfers.

use std::time::Duration;

use tokio::time::Instant;

/// Default minimum gap between two emissions (about five per second).
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(200);

/// Turns byte counters into percentages, at most once per `interval`.
///
/// One reporter belongs to one operation. Emitted values never decrease,
/// even when several branches of a save feed the same reporter.
#[derive(Debug)]
pub struct ProgressReporter {
    interval: Duration,
    last_emit: Option<Instant>,
    percent: u8,
}

impl ProgressReporter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
            percent: 0,
        }
    }

    /// Last emitted percentage.
    pub fn percent(&self) -> u8 {
        self.percent
    }

    /// Feed the current counters; returns the percentage to publish, if any.
    pub fn update(&mut self, done: u64, total: u64) -> Option<u8> {
        if total == 0 {
            return None;
        }

        let now = Instant::now();
        if let Some(last) = self.last_emit {
            if now.duration_since(last) < self.interval {
                return None;
            }
        }
        self.last_emit = Some(now);

        let computed = (u128::from(done.min(total)) * 100 / u128::from(total)) as u8;
        self.percent = self.percent.max(computed);
        Some(self.percent)
    }

    /// End of stream: always emits 100, ignoring the time gate.
    pub fn finish(&mut self) -> u8 {
        self.last_emit = Some(Instant::now());
        self.percent = 100;
        self.percent
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new(DEFAULT_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_zero_total_is_ignored() {
        let mut reporter = ProgressReporter::default();
        assert_eq!(reporter.update(10, 0), None);
        assert_eq!(reporter.percent(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_update_emits_floor_percent() {
        let mut reporter = ProgressReporter::default();
        assert_eq!(reporter.update(1, 3), Some(33));
    }

    #[tokio::test(start_paused = true)]
    async fn test_updates_are_throttled() {
        let mut reporter = ProgressReporter::default();
        assert_eq!(reporter.update(10, 100), Some(10));
        tokio::time::advance(Duration::from_millis(50)).await;
        assert_eq!(reporter.update(20, 100), None);
        tokio::time::advance(Duration::from_millis(160)).await;
        assert_eq!(reporter.update(30, 100), Some(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_decreases() {
        let mut reporter = ProgressReporter::new(Duration::ZERO);
        assert_eq!(reporter.update(80, 100), Some(80));
        assert_eq!(reporter.update(10, 100), Some(80));
    }

    #[tokio::test(start_paused = true)]
    async fn test_finish_bypasses_gate() {
        let mut reporter = ProgressReporter::default();
        assert_eq!(reporter.update(50, 100), Some(50));
        assert_eq!(reporter.finish(), 100);
        assert_eq!(reporter.percent(), 100);
    }
}
