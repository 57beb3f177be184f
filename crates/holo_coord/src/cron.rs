//! Cron interval policy for active transactions.

use std::time::Duration;

/// How the next cron interval is derived from the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronType {
    /// Return to the baseline retry interval.
    Reset,
    /// Leave the interval unchanged.
    Keep,
    /// Double the interval.
    Backoff,
}

/// Progress made since the last cron touch before a success forces a reset.
pub const RESET_AFTER: Duration = Duration::from_millis(1500);

/// Interval policy bound to one transaction's baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CronPolicy {
    /// Baseline interval in seconds (participant override or node default).
    pub baseline: u64,
    /// Optional upper bound for [`CronType::Backoff`], in seconds.
    pub cap: Option<u64>,
}

impl CronPolicy {
    pub fn new(baseline: u64, cap: Option<u64>) -> Self {
        Self {
            baseline: baseline.max(1),
            cap,
        }
    }

    pub fn next_interval(&self, current: u64, cron_type: CronType) -> u64 {
        match cron_type {
            CronType::Reset => self.baseline,
            CronType::Keep => current.max(1),
            CronType::Backoff => {
                let doubled = current.max(1).saturating_mul(2);
                match self.cap {
                    Some(cap) => doubled.min(cap.max(self.baseline)),
                    None => doubled,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_without_cap() {
        let policy = CronPolicy::new(10, None);
        let mut interval = policy.next_interval(0, CronType::Reset);
        for round in 1..=5u32 {
            interval = policy.next_interval(interval, CronType::Backoff);
            assert_eq!(interval, 10 * 2u64.pow(round));
        }
    }

    #[test]
    fn backoff_respects_cap() {
        let policy = CronPolicy::new(10, Some(35));
        assert_eq!(policy.next_interval(10, CronType::Backoff), 20);
        assert_eq!(policy.next_interval(20, CronType::Backoff), 35);
        assert_eq!(policy.next_interval(35, CronType::Backoff), 35);
    }

    #[test]
    fn keep_and_reset() {
        let policy = CronPolicy::new(7, Some(60));
        assert_eq!(policy.next_interval(40, CronType::Keep), 40);
        assert_eq!(policy.next_interval(40, CronType::Reset), 7);
        // A cap below the baseline never shrinks the interval under it.
        let low = CronPolicy::new(30, Some(5));
        assert_eq!(low.next_interval(30, CronType::Backoff), 30);
    }
}
