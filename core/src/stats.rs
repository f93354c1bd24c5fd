//! Detection history and the ranking derived from it.

use std::cmp::Ordering;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::link::SkipReason;

/// Historical record for one device. Counters saturate rather than wrap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub success_count: u32,
    pub failure_count: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub last_detected: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_connected: OffsetDateTime,
    /// Sum of the time every successful open took.
    pub connection_time: Duration,
}

impl Default for Statistics {
    fn default() -> Self {
        Self {
            success_count: 0,
            failure_count: 0,
            last_detected: OffsetDateTime::UNIX_EPOCH,
            last_connected: OffsetDateTime::UNIX_EPOCH,
            connection_time: Duration::ZERO,
        }
    }
}

impl Statistics {
    pub fn reliability(&self) -> f64 {
        reliability(self.success_count, self.failure_count)
    }

    /// Mean channel open time over confirmed detections.
    pub fn average_connection_time(&self) -> Duration {
        self.connection_time / self.success_count.max(1)
    }

    pub fn record_success(&mut self, at: OffsetDateTime) {
        self.success_count = self.success_count.saturating_add(1);
        self.failure_count = 0;
        self.last_detected = at;
    }

    pub fn record_failure(&mut self) {
        self.failure_count = self.failure_count.saturating_add(1);
    }

    pub fn record_connected(&mut self, at: OffsetDateTime) {
        self.last_connected = at;
    }

    /// Success plus the open time of the channel it was confirmed on.
    /// `connection_time` only grows here, so it pairs with `success_count`.
    pub fn record_success_after_connect(&mut self, at: OffsetDateTime, took: Duration) {
        self.record_success(at);
        self.connection_time = self.connection_time.saturating_add(took);
    }

    /// `Err` for a device that never succeeded and failed more than `limit` times.
    pub fn check_failure_limit(&self, limit: u32) -> Result<(), SkipReason> {
        if self.success_count == 0 && self.failure_count > limit {
            return Err(SkipReason::TooManyFailures { failures: self.failure_count, limit });
        }
        Ok(())
    }

    /// Best first: higher reliability, then faster average connects.
    pub fn best_first(&self, other: &Self) -> Ordering {
        other
            .reliability()
            .total_cmp(&self.reliability())
            .then_with(|| self.average_connection_time().cmp(&other.average_connection_time()))
    }
}

/// `0` without successes, `1` without failures, otherwise the success ratio.
pub fn reliability(success: u32, failure: u32) -> f64 {
    if success == 0 {
        0.0
    } else if failure == 0 {
        1.0
    } else {
        f64::from(success) / (f64::from(success) + f64::from(failure))
    }
}

/// One addressable service on a device: a radio channel, a TCP port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: u32,
    pub name: Option<String>,
    pub service_id: String,
    pub success_count: u32,
    pub failure_count: u32,
}

impl Endpoint {
    pub fn new(id: u32, service_id: impl Into<String>) -> Self {
        Self { id, name: None, service_id: service_id.into(), success_count: 0, failure_count: 0 }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn reliability(&self) -> f64 {
        reliability(self.success_count, self.failure_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(success: u32, failure: u32, connect_ms: u64) -> Statistics {
        Statistics {
            success_count: success,
            failure_count: failure,
            connection_time: Duration::from_millis(connect_ms),
            ..Statistics::default()
        }
    }

    #[test]
    fn reliability_edges() {
        assert_eq!(reliability(0, 0), 0.0);
        assert_eq!(reliability(0, 7), 0.0);
        assert_eq!(reliability(4, 0), 1.0);
        let r = reliability(3, 1);
        assert!((r - 0.75).abs() < f64::EPSILON);
        for (s, f) in [(1u32, 1u32), (1, 99), (99, 1), (u32::MAX, u32::MAX)] {
            let r = reliability(s, f);
            assert!(r > 0.0 && r < 1.0, "{s}/{f} -> {r}");
        }
    }

    #[test]
    fn reliable_devices_rank_first() {
        let a = stats(10, 0, 0);
        let b = stats(5, 5, 0);
        assert_eq!(a.best_first(&b), Ordering::Less);
        assert_eq!(b.best_first(&a), Ordering::Greater);
    }

    #[test]
    fn ties_prefer_faster_connects() {
        let fast = stats(4, 0, 400);
        let slow = stats(2, 0, 2000);
        assert_eq!(fast.best_first(&slow), Ordering::Less);
        let mut list = vec![slow.clone(), fast.clone()];
        list.sort_by(Statistics::best_first);
        assert_eq!(list, vec![fast, slow]);
    }

    #[test]
    fn equal_records_compare_equal() {
        let a = stats(3, 1, 900);
        assert_eq!(a.best_first(&a.clone()), Ordering::Equal);
    }

    #[test]
    fn success_resets_failures_and_failure_leaves_successes() {
        let mut s = stats(2, 3, 0);
        s.record_failure();
        assert_eq!((s.success_count, s.failure_count), (2, 4));
        let now = OffsetDateTime::now_utc();
        s.record_success(now);
        assert_eq!((s.success_count, s.failure_count), (3, 0));
        assert_eq!(s.last_detected, now);
    }

    #[test]
    fn connect_time_only_grows_with_successes() {
        let mut s = stats(1, 0, 300);
        let now = OffsetDateTime::now_utc();
        s.record_connected(now);
        assert_eq!(s.connection_time, Duration::from_millis(300));
        s.record_success_after_connect(now, Duration::from_millis(500));
        assert_eq!(s.success_count, 2);
        assert_eq!(s.average_connection_time(), Duration::from_millis(400));
    }

    #[test]
    fn failure_limit_applies_only_without_successes() {
        assert!(stats(0, 20, 0).check_failure_limit(20).is_ok());
        assert_eq!(
            stats(0, 21, 0).check_failure_limit(20),
            Err(SkipReason::TooManyFailures { failures: 21, limit: 20 })
        );
        assert!(stats(1, 500, 0).check_failure_limit(20).is_ok());
    }

    #[test]
    fn average_connection_time_without_successes_is_total() {
        let s = stats(0, 2, 1200);
        assert_eq!(s.average_connection_time(), Duration::from_millis(1200));
    }
}
