use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persistent retry queue entry for one (study, destination) pair.
///
/// The task carries identity only; the authoritative attempt counter and
/// backoff state live in the study's destination-status sidecar.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryTask {
    pub ae_title: String,
    pub study_uid: String,
    pub destination: String,
    pub next_retry_at: DateTime<Utc>,
}

impl RetryTask {
    pub fn new(
        ae_title: impl Into<String>,
        study_uid: impl Into<String>,
        destination: impl Into<String>,
        next_retry_at: DateTime<Utc>,
    ) -> Self {
        Self {
            ae_title: ae_title.into(),
            study_uid: study_uid.into(),
            destination: destination.into(),
            next_retry_at,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_at <= now
    }

    /// Key identifying the (study, destination) pair, used to enforce the
    /// single-in-flight-attempt invariant.
    pub fn key(&self) -> (String, String) {
        (self.study_uid.clone(), self.destination.clone())
    }
}

impl Ord for RetryTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed so a max-heap pops the earliest deadline first
        other
            .next_retry_at
            .cmp(&self.next_retry_at)
            .then_with(|| other.study_uid.cmp(&self.study_uid))
            .then_with(|| other.destination.cmp(&self.destination))
    }
}

impl PartialOrd for RetryTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BinaryHeap;

    #[test]
    fn test_heap_pops_earliest_first() {
        let now = Utc::now();
        let mut heap = BinaryHeap::new();
        heap.push(RetryTask::new("A", "1", "late", now + chrono::Duration::seconds(60)));
        heap.push(RetryTask::new("A", "1", "soon", now + chrono::Duration::seconds(5)));
        heap.push(RetryTask::new("A", "2", "now", now));
        assert_eq!(heap.pop().unwrap().destination, "now");
        assert_eq!(heap.pop().unwrap().destination, "soon");
        assert_eq!(heap.pop().unwrap().destination, "late");
    }

    #[test]
    fn test_due() {
        let now = Utc::now();
        let t = RetryTask::new("A", "1", "d", now - chrono::Duration::seconds(1));
        assert!(t.is_due(now));
        let t = RetryTask::new("A", "1", "d", now + chrono::Duration::seconds(10));
        assert!(!t.is_due(now));
    }
}
