//! Pending-request table: binds a parked caller to the ask id it waits on.
//!
//! At most one entry exists per id. Lookup and removal happen in a single
//! map operation, so a decision is delivered to at most one caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::models::Decision;

/// What a parked caller is woken with.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingOutcome {
    Resolved(Decision),
    /// A newer ask registered the same id.
    Superseded,
    /// Swept as stale before any decision arrived.
    Expired,
}

pub type ResolutionHandle = oneshot::Sender<PendingOutcome>;

pub struct PendingEntry {
    handle: ResolutionHandle,
    created_at: Instant,
    generation: u64,
}

impl PendingEntry {
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Identifies one specific registration of an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub request_id: String,
    pub generation: u64,
}

#[derive(Default)]
pub struct PendingTable {
    entries: DashMap<String, PendingEntry>,
    generations: AtomicU64,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `handle` to `request_id`. Last writer wins: a previous binding
    /// for the same id is woken with [`PendingOutcome::Superseded`].
    pub fn register(&self, request_id: &str, handle: ResolutionHandle) -> Registration {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = PendingEntry {
            handle,
            created_at: Instant::now(),
            generation,
        };
        if let Some(previous) = self.entries.insert(request_id.to_string(), entry) {
            debug!(request_id = %request_id, "pending entry superseded");
            let _ = previous.handle.send(PendingOutcome::Superseded);
        }
        Registration {
            request_id: request_id.to_string(),
            generation,
        }
    }

    /// Removes the entry for `request_id` and completes it with `decision`.
    /// Returns false when nobody was waiting; the event is dropped.
    pub fn resolve(&self, request_id: &str, decision: Decision) -> bool {
        match self.entries.remove(request_id) {
            Some((_, entry)) => {
                if entry.handle.send(PendingOutcome::Resolved(decision)).is_err() {
                    debug!(request_id = %request_id, "waiter already gone");
                }
                true
            }
            None => {
                debug!(request_id = %request_id, "no pending entry, dropping decision");
                false
            }
        }
    }

    /// Removes the entry only if it still belongs to `registration`, so a
    /// stale waiter never evicts the binding that superseded it.
    pub fn release(&self, registration: &Registration) -> bool {
        self.entries
            .remove_if(&registration.request_id, |_, e| {
                e.generation == registration.generation
            })
            .is_some()
    }

    /// Wakes and removes every entry older than `max_age`.
    pub fn evict_older_than(&self, max_age: Duration) -> usize {
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().age() >= max_age)
            .map(|e| e.key().clone())
            .collect();

        let mut evicted = 0;
        for id in stale {
            if let Some((_, entry)) = self.entries.remove_if(&id, |_, e| e.age() >= max_age) {
                let _ = entry.handle.send(PendingOutcome::Expired);
                evicted += 1;
            }
        }
        evicted
    }

    /// Drops every entry; their waiters observe a closed channel.
    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.entries.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Releases its registration when dropped, covering callers that time out
/// or whose connection is dropped mid-wait.
pub struct PendingGuard {
    table: Arc<PendingTable>,
    registration: Registration,
}

impl PendingGuard {
    pub fn new(table: Arc<PendingTable>, registration: Registration) -> Self {
        Self {
            table,
            registration,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.registration.request_id
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.table.release(&self.registration) {
            debug!(request_id = %self.registration.request_id, "released pending entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Status;

    fn approved(id: &str) -> Decision {
        Decision {
            status: Status::Approved,
            ..Decision::pending(id)
        }
    }

    #[tokio::test]
    async fn test_resolve_wakes_only_matching_waiter() {
        let table = PendingTable::new();
        let (tx_a, rx_a) = oneshot::channel();
        let (tx_b, mut rx_b) = oneshot::channel();
        table.register("a", tx_a);
        table.register("b", tx_b);

        assert!(table.resolve("a", approved("a")));
        assert_eq!(rx_a.await.unwrap(), PendingOutcome::Resolved(approved("a")));
        assert!(rx_b.try_recv().is_err());
        assert!(table.contains("b"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_unknown_or_repeated_resolve_is_silent() {
        let table = PendingTable::new();
        assert!(!table.resolve("ghost", approved("ghost")));

        let (tx, _rx) = oneshot::channel();
        table.register("once", tx);
        assert!(table.resolve("once", approved("once")));
        assert!(!table.resolve("once", approved("once")));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_last_writer_wins() {
        let table = PendingTable::new();
        let (tx_old, rx_old) = oneshot::channel();
        let (tx_new, rx_new) = oneshot::channel();
        table.register("dup", tx_old);
        table.register("dup", tx_new);
        assert_eq!(table.len(), 1);

        assert_eq!(rx_old.await.unwrap(), PendingOutcome::Superseded);
        table.resolve("dup", approved("dup"));
        assert_eq!(rx_new.await.unwrap(), PendingOutcome::Resolved(approved("dup")));
    }

    #[test]
    fn test_stale_release_keeps_newer_binding() {
        let table = Arc::new(PendingTable::new());
        let (tx_old, _rx_old) = oneshot::channel();
        let (tx_new, _rx_new) = oneshot::channel();
        let old = table.register("dup", tx_old);
        let new = table.register("dup", tx_new);

        drop(PendingGuard::new(table.clone(), old));
        assert!(table.contains("dup"));

        drop(PendingGuard::new(table.clone(), new));
        assert!(!table.contains("dup"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_older_than() {
        let table = PendingTable::new();
        let (tx_old, rx_old) = oneshot::channel();
        table.register("old", tx_old);

        tokio::time::advance(Duration::from_secs(120)).await;

        let (tx_fresh, _rx_fresh) = oneshot::channel();
        table.register("fresh", tx_fresh);

        assert_eq!(table.evict_older_than(Duration::from_secs(60)), 1);
        assert_eq!(rx_old.await.unwrap(), PendingOutcome::Expired);
        assert!(table.contains("fresh"));
        assert!(!table.contains("old"));
    }
}
