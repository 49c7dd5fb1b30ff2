//! In-process topology store
//!
//! Holds the current [`Contract`] behind an [`ArcSwap`], so readers never
//! take a lock and the single writer path advances it with a
//! compare-and-replace that only succeeds for a strictly greater generation.
//! Replaying an older or equal contract is a harmless no-op.

use crate::contract::Contract;
use arc_swap::ArcSwap;
use std::sync::Arc;
use tracing::{debug, info};

/// Current routing topology of this process
#[derive(Debug)]
pub struct TopologyStore {
    current: ArcSwap<Contract>,
}

impl Default for TopologyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TopologyStore {
    /// Create a store holding the empty contract at generation 0
    pub fn new() -> Self {
        Self::with_contract(Contract::default())
    }

    /// Create a store seeded with an existing contract (e.g. the one found in
    /// shared storage at startup)
    pub fn with_contract(contract: Contract) -> Self {
        Self {
            current: ArcSwap::new(Arc::new(contract)),
        }
    }

    /// Snapshot of the current contract
    pub fn current(&self) -> Arc<Contract> {
        self.current.load_full()
    }

    /// Generation of the current contract
    pub fn generation(&self) -> u64 {
        self.current.load().generation
    }

    /// Replace the current contract iff `candidate` has a strictly greater
    /// generation. Returns whether the candidate was applied.
    pub fn try_advance(&self, candidate: Contract) -> bool {
        let candidate = Arc::new(candidate);
        let mut current = self.current.load();

        loop {
            if candidate.generation <= current.generation {
                info!(
                    candidate = candidate.generation,
                    current = current.generation,
                    "Ignoring stale contract"
                );
                return false;
            }

            let previous = self
                .current
                .compare_and_swap(&*current, Arc::clone(&candidate));
            if Arc::ptr_eq(&*previous, &*current) {
                debug!(
                    generation = candidate.generation,
                    resources = candidate.resources.len(),
                    "Topology advanced"
                );
                return true;
            }

            // Lost the race; re-check against whatever won.
            current = previous;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::Resource;

    fn contract(generation: u64, uids: &[&str]) -> Contract {
        Contract::new(
            generation,
            uids.iter()
                .map(|uid| Resource {
                    uid: uid.to_string(),
                    ..Default::default()
                })
                .collect(),
        )
    }

    #[test]
    fn test_starts_empty() {
        let store = TopologyStore::new();
        assert_eq!(store.generation(), 0);
        assert!(store.current().is_empty());
    }

    #[test]
    fn test_advance_on_greater_generation() {
        let store = TopologyStore::new();
        assert!(store.try_advance(contract(1, &["a"])));
        assert!(store.try_advance(contract(3, &["a", "b"])));
        assert_eq!(store.generation(), 3);
        assert_eq!(store.current().resources.len(), 2);
    }

    #[test]
    fn test_stale_write_is_noop() {
        let store = TopologyStore::with_contract(contract(5, &["a"]));
        assert!(!store.try_advance(contract(4, &["b"])));
        assert!(!store.try_advance(contract(5, &["c"])));
        assert_eq!(store.current().resources[0].uid, "a");
    }

    #[test]
    fn test_try_advance_idempotent() {
        let store = TopologyStore::new();
        let c = contract(2, &["a"]);

        assert!(store.try_advance(c.clone()));
        let after_first = store.current();

        assert!(!store.try_advance(c));
        assert!(Arc::ptr_eq(&after_first, &store.current()));
    }

    #[test]
    fn test_concurrent_writers_keep_max_generation() {
        let store = Arc::new(TopologyStore::new());
        let handles: Vec<_> = (1..=8u64)
            .map(|worker| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for generation in (worker..=200).step_by(8) {
                        store.try_advance(contract(generation, &[]));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.generation(), 200);
    }
}
