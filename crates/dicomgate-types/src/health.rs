use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Rolling availability bookkeeping for one destination.
///
/// Updated only by the health monitor; the scheduler and retry manager read
/// the cached `available` flag and never block on a probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationHealth {
    pub destination: String,
    pub available: bool,
    pub total_checks: u64,
    pub successful_checks: u64,
    pub consecutive_failures: u32,
    pub last_check_at: Option<DateTime<Utc>>,
    pub last_available_at: Option<DateTime<Utc>>,
    /// Set on the available -> unavailable transition, cleared on recovery
    pub unavailable_since: Option<DateTime<Utc>>,
}

impl DestinationHealth {
    /// A fresh record is optimistically available so the first fan-out
    /// before any probe completes is attempted rather than deferred.
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            available: true,
            total_checks: 0,
            successful_checks: 0,
            consecutive_failures: 0,
            last_check_at: None,
            last_available_at: None,
            unavailable_since: None,
        }
    }

    pub fn record_success(&mut self) {
        let now = Utc::now();
        self.total_checks += 1;
        self.successful_checks += 1;
        self.consecutive_failures = 0;
        self.last_check_at = Some(now);
        self.last_available_at = Some(now);
        self.available = true;
        self.unavailable_since = None;
    }

    pub fn record_failure(&mut self) {
        let now = Utc::now();
        self.total_checks += 1;
        self.consecutive_failures += 1;
        self.last_check_at = Some(now);
        if self.available {
            self.unavailable_since = Some(now);
        }
        self.available = false;
    }

    /// `successful_checks / total_checks` over the life of the record.
    pub fn availability_percent(&self) -> f64 {
        if self.total_checks == 0 {
            return 100.0;
        }
        self.successful_checks as f64 / self.total_checks as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_record_is_available() {
        let h = DestinationHealth::new("peer1");
        assert!(h.available);
        assert_eq!(h.availability_percent(), 100.0);
    }

    #[test]
    fn test_unavailable_since_set_once() {
        let mut h = DestinationHealth::new("peer1");
        h.record_failure();
        let since = h.unavailable_since.expect("set on transition");
        h.record_failure();
        assert_eq!(h.unavailable_since, Some(since));
        assert_eq!(h.consecutive_failures, 2);
    }

    #[test]
    fn test_recovery_clears_unavailable_since() {
        let mut h = DestinationHealth::new("peer1");
        h.record_failure();
        h.record_success();
        assert!(h.available);
        assert!(h.unavailable_since.is_none());
        assert_eq!(h.consecutive_failures, 0);
    }

    #[test]
    fn test_availability_percent_exact() {
        let mut h = DestinationHealth::new("peer1");
        h.record_success();
        h.record_success();
        h.record_failure();
        h.record_success();
        assert_eq!(h.total_checks, 4);
        assert_eq!(h.successful_checks, 3);
        assert_eq!(h.availability_percent(), 75.0);
    }
}
