//! Contract synchronization
//!
//! Ties the control-plane pieces together: routing fragments are collected
//! from the controllers, merged by the builder, advanced into the topology
//! store and published. Builds run one at a time; readers of the current
//! contract never wait on them.

use crate::builder::{self, BuildOutcome};
use crate::error::Result;
use crate::fragment::{CandidateAddress, RoutingFragment};
use crate::prober::Prober;
use crate::publisher::ContractPublisher;
use dashmap::DashMap;
use kafka_eventing_contract::{Contract, ContractStorage, TopologyStore};
use regex::bytes::Regex;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

static GENERATION_FIELD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""generation"\s*:\s*(\d+)"#).unwrap());

/// Generation field of a payload that no longer decodes as a whole
fn salvage_generation(payload: &[u8]) -> Option<u64> {
    let captures = GENERATION_FIELD.captures(payload)?;
    std::str::from_utf8(captures.get(1)?.as_bytes())
        .ok()?
        .parse()
        .ok()
}

/// Key identifying a fragment's contributing object
pub fn fragment_key(kind: &str, namespace: &str, name: &str) -> String {
    format!("{}/{}/{}", kind, namespace, name)
}

/// Routing state of a single uid after a sync
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteState {
    /// Present in the current contract
    Routed,
    /// Address not ready yet
    Pending { failures: u32 },
    /// Egress whose parent is missing or pending
    Detached,
    /// Not part of the last build
    Unknown,
}

/// Result of one sync
#[derive(Debug, Clone)]
pub struct SyncReport {
    /// Generation of the store after the sync
    pub generation: u64,
    /// Whether the build minted a new generation
    pub changed: bool,
    /// Whether anything was written to storage
    pub published: bool,
    pub outcome: BuildOutcome,
}

impl SyncReport {
    pub fn state(&self, uid: &str) -> RouteState {
        if let Some(pending) = self.outcome.pending_resource(uid) {
            return RouteState::Pending {
                failures: pending.failures,
            };
        }
        if self.outcome.detached_egress(uid).is_some() {
            return RouteState::Detached;
        }
        let contract = &self.outcome.contract;
        let routed = contract.resource(uid).is_some()
            || contract
                .resources
                .iter()
                .any(|r| r.egresses.iter().any(|e| e.uid == uid));
        if routed {
            RouteState::Routed
        } else {
            RouteState::Unknown
        }
    }
}

/// Control-plane contract synchronizer
pub struct ContractSync<S: ContractStorage> {
    store: TopologyStore,
    prober: Prober,
    publisher: ContractPublisher<S>,
    fragments: DashMap<String, RoutingFragment>,
    /// Addresses the current contract's resources were admitted through.
    /// Its lock also serializes builds.
    admitted: Mutex<HashMap<String, CandidateAddress>>,
}

impl<S: ContractStorage> ContractSync<S> {
    /// Obtain the storage entry and seed the store from it.
    ///
    /// Fails when the entry cannot be read or created. An undecodable stored
    /// payload is replaced on the next sync. Its generation is recovered when
    /// still legible, so replicas that applied it keep accepting what comes
    /// next; otherwise numbering restarts from zero.
    pub async fn start(storage: S, prober: Prober) -> Result<Self> {
        let existing = storage.get_or_create().await?;

        let (seed, last_published) = match existing {
            Some(payload) => match Contract::from_bytes(&payload) {
                Ok(contract) => {
                    let generation = contract.generation;
                    (contract, Some(generation))
                }
                Err(e) => match salvage_generation(&payload) {
                    Some(generation) => {
                        warn!(
                            error = %e,
                            generation,
                            "Stored contract is unreadable, continuing after its generation"
                        );
                        (
                            Contract::new(generation.saturating_add(1), Vec::new()),
                            Some(generation),
                        )
                    }
                    None => {
                        warn!(error = %e, "Stored contract is unreadable, starting from empty");
                        (Contract::default(), None)
                    }
                },
            },
            None => (Contract::default(), None),
        };

        info!(
            generation = seed.generation,
            resources = seed.resources.len(),
            "Topology store seeded from storage"
        );

        Ok(Self {
            store: TopologyStore::with_contract(seed),
            prober,
            publisher: ContractPublisher::resume(storage, last_published),
            fragments: DashMap::new(),
            admitted: Mutex::new(HashMap::new()),
        })
    }

    /// Insert or replace the fragment contributed by `key`
    pub fn upsert(&self, key: String, fragment: RoutingFragment) {
        self.fragments.insert(key, fragment);
    }

    /// Drop the fragment contributed by `key`
    pub fn remove(&self, key: &str) -> bool {
        self.fragments.remove(key).is_some()
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    /// Snapshot of the current contract
    pub fn current(&self) -> Arc<Contract> {
        self.store.current()
    }

    pub fn prober(&self) -> &Prober {
        &self.prober
    }

    pub fn publisher(&self) -> &ContractPublisher<S> {
        &self.publisher
    }

    /// Build from the collected fragments, advance the store and publish.
    ///
    /// A generation that advanced the store but failed to publish is
    /// published again by the next sync, even when nothing else changed.
    #[instrument(skip(self))]
    pub async fn sync(&self) -> Result<SyncReport> {
        let mut admitted = self.admitted.lock().await;

        let fragments: Vec<RoutingFragment> = self
            .fragments
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let current = self.store.current();
        let outcome = builder::build(fragments, &self.prober, &current, &admitted);

        self.prober.retain(&outcome.referenced);
        if !outcome.changed || self.store.try_advance(outcome.contract.clone()) {
            *admitted = outcome.admitted.clone();
        }

        let latest = self.store.current();
        let behind = match self.publisher.last_published().await {
            Some(last) => latest.generation > last,
            None => latest.generation > 0,
        };
        let published = if behind {
            self.publisher.publish(&latest).await?
        } else {
            debug!(generation = latest.generation, "Contract unchanged");
            false
        };

        metrics::gauge!("kafka_eventing_contract_generation").set(latest.generation as f64);
        if !outcome.pending.is_empty() {
            debug!(pending = outcome.pending.len(), "Resources waiting for readiness");
        }

        Ok(SyncReport {
            generation: latest.generation,
            changed: outcome.changed,
            published,
            outcome,
        })
    }

    /// Recreate the storage entry after it was deleted and publish the
    /// current contract into it
    pub async fn recover_storage(&self) -> Result<SyncReport> {
        {
            let _admitted = self.admitted.lock().await;
            self.publisher.storage().get_or_create().await?;
            self.publisher.reset().await;
        }
        info!("Contract storage recreated, republishing");
        self.sync().await
    }

    /// Publish the drain contract and advance the store to it. The drain
    /// takes the next generation after both the store and the last publish.
    /// Idempotent.
    pub async fn close(&self) -> Result<bool> {
        let _admitted = self.admitted.lock().await;
        if self.publisher.is_closed().await {
            return Ok(false);
        }

        let last = self.publisher.last_published().await.unwrap_or(0);
        let generation = self.store.generation().max(last).saturating_add(1);
        match self.publisher.close(generation).await? {
            Some(generation) => {
                self.store.try_advance(Contract::drain(generation));
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::tests::{broker, context, trigger};
    use crate::fragment::{FragmentKind, RoutingSource};
    use crate::prober::tests::{eventually, fast_config, ScriptedTransport};
    use crate::prober::TrustRoots;
    use crate::publisher::tests::FailingStorage;
    use kafka_eventing_contract::{MemoryStorage, Resource};

    fn fragment(source: RoutingSource) -> (String, RoutingFragment) {
        let key = fragment_key(source.kind(), &source.namespace(), &source.name());
        (key, source.fragment(&context()).unwrap())
    }

    fn address_of(fragment: &RoutingFragment) -> CandidateAddress {
        fragment.address().cloned().unwrap()
    }

    fn stored(storage: &MemoryStorage) -> Contract {
        Contract::from_bytes(&storage.payload().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_seeded_from_stored_contract() {
        let storage = MemoryStorage::new();
        let previous = Contract::new(
            5,
            vec![Resource {
                uid: "gone".to_string(),
                ..Default::default()
            }],
        );
        storage.set(previous.to_bytes().unwrap());

        let prober = Prober::new(
            fast_config(),
            Arc::new(ScriptedTransport::default()),
            TrustRoots::empty(),
        );
        let sync = ContractSync::start(storage.clone(), prober).await.unwrap();
        assert_eq!(sync.current().generation, 5);
        assert_eq!(sync.publisher().last_published().await, Some(5));

        let report = sync.sync().await.unwrap();
        assert!(report.changed);
        assert!(report.published);
        assert_eq!(stored(&storage).generation, 6);
        assert!(stored(&storage).is_empty());
    }

    #[tokio::test]
    async fn test_empty_storage_not_written_until_change() {
        let storage = MemoryStorage::new();
        let prober = Prober::new(
            fast_config(),
            Arc::new(ScriptedTransport::default()),
            TrustRoots::empty(),
        );
        let sync = ContractSync::start(storage.clone(), prober).await.unwrap();

        let report = sync.sync().await.unwrap();
        assert_eq!(report.generation, 0);
        assert!(!report.published);
        assert!(storage.payload().is_none());
    }

    #[tokio::test]
    async fn test_pending_resource_published_once_ready() {
        let storage = MemoryStorage::new();
        let transport = Arc::new(ScriptedTransport::default());
        let prober = Prober::new(fast_config(), transport.clone(), TrustRoots::empty());
        let sync = ContractSync::start(storage.clone(), prober).await.unwrap();

        let (key, broker) = fragment(RoutingSource::Broker(Arc::new(broker("ns", "b", "b-uid"))));
        let (trigger_key, trigger) = fragment(RoutingSource::Trigger(Arc::new(trigger(
            "ns", "t", "t-uid", "b",
        ))));
        let address = address_of(&broker);
        sync.upsert(key, broker);
        sync.upsert(trigger_key, trigger);

        let report = sync.sync().await.unwrap();
        assert!(matches!(report.state("b-uid"), RouteState::Pending { .. }));
        assert_eq!(report.state("t-uid"), RouteState::Detached);
        assert!(storage.payload().is_none());

        transport.set_ready(&address, true);
        eventually(|| sync.prober().is_ready(&address)).await;

        let report = sync.sync().await.unwrap();
        assert_eq!(report.generation, 1);
        assert_eq!(report.state("b-uid"), RouteState::Routed);
        assert_eq!(report.state("t-uid"), RouteState::Routed);
        assert_eq!(stored(&storage).egress_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_publish_caught_up_by_next_sync() {
        let transport = Arc::new(ScriptedTransport::default());
        let prober = Prober::new(fast_config(), transport.clone(), TrustRoots::empty());
        let sync = ContractSync::start(FailingStorage::new(1), prober)
            .await
            .unwrap();

        let (key, broker) = fragment(RoutingSource::Broker(Arc::new(broker("ns", "b", "b-uid"))));
        let address = address_of(&broker);
        transport.set_ready(&address, true);
        sync.upsert(key, broker);
        eventually(|| sync.prober().is_ready(&address)).await;

        assert!(sync.sync().await.is_err());
        assert_eq!(sync.current().generation, 1);
        assert!(sync.publisher().storage().inner.payload().is_none());

        let report = sync.sync().await.unwrap();
        assert!(!report.changed);
        assert!(report.published);
        assert_eq!(stored(&sync.publisher().storage().inner).generation, 1);
    }

    #[tokio::test]
    async fn test_removed_fragment_releases_probe_entry() {
        let storage = MemoryStorage::new();
        let transport = Arc::new(ScriptedTransport::default());
        let prober = Prober::new(fast_config(), transport, TrustRoots::empty());
        let sync = ContractSync::start(storage, prober).await.unwrap();

        let (key, broker) = fragment(RoutingSource::Broker(Arc::new(broker("ns", "b", "b-uid"))));
        sync.upsert(key.clone(), broker);
        sync.sync().await.unwrap();
        assert_eq!(sync.prober().tracked(), 1);

        assert!(sync.remove(&key));
        sync.sync().await.unwrap();
        assert_eq!(sync.prober().tracked(), 0);
        assert_eq!(sync.fragment_count(), 0);
    }

    #[tokio::test]
    async fn test_recover_storage_republishes_current() {
        let storage = MemoryStorage::new();
        storage.set(Contract::new(3, Vec::new()).to_bytes().unwrap());
        let prober = Prober::new(
            fast_config(),
            Arc::new(ScriptedTransport::default()),
            TrustRoots::empty(),
        );
        let sync = ContractSync::start(storage.clone(), prober).await.unwrap();

        let report = sync.recover_storage().await.unwrap();
        assert!(report.published);
        assert_eq!(stored(&storage).generation, 3);
    }

    #[tokio::test]
    async fn test_close_publishes_drain() {
        let storage = MemoryStorage::new();
        storage.set(Contract::new(4, Vec::new()).to_bytes().unwrap());
        let prober = Prober::new(
            fast_config(),
            Arc::new(ScriptedTransport::default()),
            TrustRoots::empty(),
        );
        let sync = ContractSync::start(storage.clone(), prober).await.unwrap();

        assert!(sync.close().await.unwrap());
        assert!(!sync.close().await.unwrap());
        assert_eq!(stored(&storage).generation, 5);
    }

    #[tokio::test]
    async fn test_close_after_failed_publish_drains_past_store() {
        let transport = Arc::new(ScriptedTransport::default());
        let prober = Prober::new(fast_config(), transport.clone(), TrustRoots::empty());
        let sync = ContractSync::start(FailingStorage::new(1), prober)
            .await
            .unwrap();

        let (key, broker) = fragment(RoutingSource::Broker(Arc::new(broker("ns", "b", "b-uid"))));
        let address = address_of(&broker);
        transport.set_ready(&address, true);
        sync.upsert(key, broker);
        eventually(|| sync.prober().is_ready(&address)).await;

        assert!(sync.sync().await.is_err());
        assert_eq!(sync.current().generation, 1);

        assert!(sync.close().await.unwrap());
        let drained = stored(&sync.publisher().storage().inner);
        assert_eq!(drained.generation, 2);
        assert!(drained.is_empty());
        assert_eq!(sync.current().generation, 2);
        assert!(sync.current().is_empty());
        assert!(!sync.close().await.unwrap());
    }

    #[tokio::test]
    async fn test_close_without_anything_published_uses_generation_one() {
        let storage = MemoryStorage::new();
        let prober = Prober::new(
            fast_config(),
            Arc::new(ScriptedTransport::default()),
            TrustRoots::empty(),
        );
        let sync = ContractSync::start(storage.clone(), prober).await.unwrap();

        assert!(sync.close().await.unwrap());
        assert_eq!(stored(&storage).generation, 1);
    }

    #[tokio::test]
    async fn test_corrupt_stored_contract_keeps_generation() {
        let storage = MemoryStorage::new();
        storage.set(br#"{"generation": 9, "resources": [{"uid": "#.to_vec());
        let prober = Prober::new(
            fast_config(),
            Arc::new(ScriptedTransport::default()),
            TrustRoots::empty(),
        );
        let sync = ContractSync::start(storage.clone(), prober).await.unwrap();
        assert_eq!(sync.current().generation, 10);
        assert_eq!(sync.publisher().last_published().await, Some(9));

        let report = sync.sync().await.unwrap();
        assert!(report.published);
        let rewritten = stored(&storage);
        assert_eq!(rewritten.generation, 10);
        assert!(rewritten.is_empty());
    }

    #[tokio::test]
    async fn test_illegible_stored_contract_starts_from_zero() {
        let storage = MemoryStorage::new();
        storage.set(b"\x00\x01 not json".to_vec());
        let prober = Prober::new(
            fast_config(),
            Arc::new(ScriptedTransport::default()),
            TrustRoots::empty(),
        );
        let sync = ContractSync::start(storage, prober).await.unwrap();
        assert_eq!(sync.current().generation, 0);
        assert_eq!(sync.publisher().last_published().await, None);
    }

    #[tokio::test]
    async fn test_moved_address_is_gated_again() {
        let storage = MemoryStorage::new();
        let transport = Arc::new(ScriptedTransport::default());
        let prober = Prober::new(fast_config(), transport.clone(), TrustRoots::empty());
        let sync = ContractSync::start(storage.clone(), prober).await.unwrap();

        let (key, broker) = fragment(RoutingSource::Broker(Arc::new(broker("ns", "b", "b-uid"))));
        let plain = address_of(&broker);
        transport.set_ready(&plain, true);
        sync.upsert(key.clone(), broker.clone());
        eventually(|| sync.prober().is_ready(&plain)).await;
        assert_eq!(sync.sync().await.unwrap().state("b-uid"), RouteState::Routed);

        let tls = CandidateAddress::tls(plain.host.clone(), 443, plain.path.clone());
        let mut moved = broker;
        if let FragmentKind::Resource { address, .. } = &mut moved.kind {
            *address = tls.clone();
        }
        sync.upsert(key.clone(), moved.clone());
        let report = sync.sync().await.unwrap();
        assert!(matches!(report.state("b-uid"), RouteState::Pending { .. }));
        assert!(stored(&storage).is_empty());

        transport.set_ready(&tls, true);
        eventually(|| sync.prober().is_ready(&tls)).await;
        let report = sync.sync().await.unwrap();
        assert_eq!(report.state("b-uid"), RouteState::Routed);
        assert_eq!(report.generation, 3);
    }
}
