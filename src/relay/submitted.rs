//! Asks published through `submit` with nobody parked on them. Their status
//! is read back by polling `fetch_status`, so the latest known decision is
//! kept per id until it ages out.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::models::Decision;

struct Tracked {
    decision: Decision,
    since: Instant,
}

#[derive(Default)]
pub struct SubmittedTable {
    entries: DashMap<String, Tracked>,
}

impl SubmittedTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking `request_id` as PENDING. Re-submitting an id resets it.
    pub fn track(&self, request_id: &str) {
        self.entries.insert(
            request_id.to_string(),
            Tracked {
                decision: Decision::pending(request_id),
                since: Instant::now(),
            },
        );
    }

    /// Records the decision for a tracked id. Terminal decisions are never
    /// revised, so only the first one sticks. Returns whether it was stored.
    pub fn record(&self, request_id: &str, decision: Decision) -> bool {
        match self.entries.get_mut(request_id) {
            Some(mut tracked) if !tracked.decision.status.is_terminal() => {
                tracked.decision = decision;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, request_id: &str) -> Option<Decision> {
        self.entries.get(request_id).map(|t| t.decision.clone())
    }

    pub fn forget(&self, request_id: &str) -> bool {
        self.entries.remove(request_id).is_some()
    }

    /// Drops entries tracked for at least `max_age`, decided or not.
    pub fn evict_older_than(&self, max_age: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, t| t.since.elapsed() < max_age);
        before.saturating_sub(self.entries.len())
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Status;

    fn decided(id: &str, status: Status) -> Decision {
        Decision {
            status,
            ..Decision::pending(id)
        }
    }

    #[test]
    fn test_untracked_ids_are_ignored() {
        let table = SubmittedTable::new();
        assert!(!table.record("req_x", decided("req_x", Status::Approved)));
        assert!(table.get("req_x").is_none());
    }

    #[test]
    fn test_first_terminal_decision_sticks() {
        let table = SubmittedTable::new();
        table.track("req_1");
        assert_eq!(table.get("req_1").unwrap().status, Status::Pending);

        assert!(table.record("req_1", decided("req_1", Status::Rejected)));
        assert!(!table.record("req_1", decided("req_1", Status::Approved)));
        assert_eq!(table.get("req_1").unwrap().status, Status::Rejected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_older_than() {
        let table = SubmittedTable::new();
        table.track("old");
        tokio::time::advance(Duration::from_secs(120)).await;
        table.track("fresh");

        assert_eq!(table.evict_older_than(Duration::from_secs(60)), 1);
        assert!(table.get("old").is_none());
        assert!(table.get("fresh").is_some());
    }
}
