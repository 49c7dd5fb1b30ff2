//! Bus consumers
//!
//! The receiver maps ingress paths to the topics they produce to; the
//! dispatcher tracks one consumer per egress. Both rebuild their tables from
//! each contract they receive, and both stop routing once they see the drain
//! contract published on shutdown.

use crate::bus::Subscription;
use kafka_eventing_contract::{Contract, Egress};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Difference between two routing tables
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
}

impl RouteDiff {
    /// Whether nothing changed
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }

    fn between<V: PartialEq>(old: &HashMap<String, V>, new: &HashMap<String, V>) -> Self {
        let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
        let mut diff = RouteDiff::default();
        for key in keys {
            match (old.get(key), new.get(key)) {
                (None, Some(_)) => diff.added.push(key.clone()),
                (Some(_), None) => diff.removed.push(key.clone()),
                (Some(a), Some(b)) if a != b => diff.updated.push(key.clone()),
                _ => {}
            }
        }
        diff
    }
}

/// Where an ingress path sends events
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressRoute {
    pub resource_uid: String,
    pub topics: Vec<String>,
    pub bootstrap_servers: String,
}

/// Ingress side: path to topic routing table
#[derive(Debug, Default)]
pub struct Receiver {
    routes: RwLock<HashMap<String, IngressRoute>>,
    generation: RwLock<Option<u64>>,
}

impl Receiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the routing table with the one described by `contract`
    pub fn apply(&self, contract: &Contract) -> RouteDiff {
        let next: HashMap<String, IngressRoute> = contract
            .resources
            .iter()
            .filter_map(|resource| {
                resource.ingress.as_ref().map(|ingress| {
                    (
                        ingress.path.clone(),
                        IngressRoute {
                            resource_uid: resource.uid.clone(),
                            topics: resource.topics.clone(),
                            bootstrap_servers: resource.bootstrap_servers.clone(),
                        },
                    )
                })
            })
            .collect();

        let mut routes = self.routes.write();
        let diff = RouteDiff::between(&routes, &next);
        *routes = next;
        *self.generation.write() = Some(contract.generation);
        diff
    }

    /// Look up the route for an ingress path
    pub fn route(&self, path: &str) -> Option<IngressRoute> {
        self.routes.read().get(path).cloned()
    }

    pub fn route_count(&self) -> usize {
        self.routes.read().len()
    }

    pub fn generation(&self) -> Option<u64> {
        *self.generation.read()
    }
}

/// Egress side: one consumer per egress uid
#[derive(Debug, Default)]
pub struct Dispatcher {
    consumers: RwLock<HashMap<String, Egress>>,
    generation: RwLock<Option<u64>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile the consumer set against `contract`
    pub fn apply(&self, contract: &Contract) -> RouteDiff {
        let next: HashMap<String, Egress> = contract
            .resources
            .iter()
            .flat_map(|resource| resource.egresses.iter())
            .map(|egress| (egress.uid.clone(), egress.clone()))
            .collect();

        let mut consumers = self.consumers.write();
        let diff = RouteDiff::between(&consumers, &next);
        *consumers = next;
        *self.generation.write() = Some(contract.generation);
        diff
    }

    /// Consumer for an egress uid
    pub fn consumer(&self, uid: &str) -> Option<Egress> {
        self.consumers.read().get(uid).cloned()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.read().len()
    }

    pub fn generation(&self) -> Option<u64> {
        *self.generation.read()
    }
}

/// Drive a receiver from a bus subscription until the bus closes
pub fn spawn_receiver(receiver: Arc<Receiver>, mut subscription: Subscription) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(contract) = subscription.recv().await {
            let diff = receiver.apply(&contract);
            if !diff.is_empty() {
                info!(
                    generation = contract.generation,
                    added = diff.added.len(),
                    removed = diff.removed.len(),
                    updated = diff.updated.len(),
                    "Receiver routes updated"
                );
            }
        }
        debug!("Receiver subscription ended");
    })
}

/// Drive a dispatcher from a bus subscription until the bus closes
pub fn spawn_dispatcher(
    dispatcher: Arc<Dispatcher>,
    mut subscription: Subscription,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(contract) = subscription.recv().await {
            let diff = dispatcher.apply(&contract);
            if !diff.is_empty() {
                info!(
                    generation = contract.generation,
                    started = diff.added.len(),
                    stopped = diff.removed.len(),
                    updated = diff.updated.len(),
                    "Dispatcher consumers updated"
                );
            }
        }
        debug!("Dispatcher subscription ended");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ContractBus;
    use kafka_eventing_contract::{Ingress, Resource};

    fn resource(uid: &str, path: &str, egresses: &[&str]) -> Resource {
        Resource {
            uid: uid.to_string(),
            topics: vec![format!("knative-broker-{}", uid)],
            bootstrap_servers: "kafka:9092".to_string(),
            ingress: Some(Ingress {
                path: path.to_string(),
                host: None,
            }),
            egresses: egresses
                .iter()
                .map(|uid| Egress {
                    uid: uid.to_string(),
                    consumer_group: format!("group-{}", uid),
                    destination: "http://sink".to_string(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_receiver_diff() {
        let receiver = Receiver::new();
        let diff = receiver.apply(&Contract::new(1, vec![resource("a", "/ns/a", &[])]));
        assert_eq!(diff.added, vec!["/ns/a".to_string()]);

        let diff = receiver.apply(&Contract::new(
            2,
            vec![resource("b", "/ns/b", &[])],
        ));
        assert_eq!(diff.added, vec!["/ns/b".to_string()]);
        assert_eq!(diff.removed, vec!["/ns/a".to_string()]);
        assert_eq!(receiver.route("/ns/b").unwrap().resource_uid, "b");
        assert_eq!(receiver.generation(), Some(2));
    }

    #[test]
    fn test_dispatcher_diff() {
        let dispatcher = Dispatcher::new();
        dispatcher.apply(&Contract::new(1, vec![resource("a", "/ns/a", &["t1", "t2"])]));
        assert_eq!(dispatcher.consumer_count(), 2);

        let mut changed = resource("a", "/ns/a", &["t1"]);
        changed.egresses[0].destination = "http://other".to_string();
        let diff = dispatcher.apply(&Contract::new(2, vec![changed]));
        assert_eq!(diff.removed, vec!["t2".to_string()]);
        assert_eq!(diff.updated, vec!["t1".to_string()]);
        assert!(diff.added.is_empty());
    }

    #[tokio::test]
    async fn test_drain_clears_tables() {
        let bus = ContractBus::default();
        let receiver = Arc::new(Receiver::new());
        let dispatcher = Arc::new(Dispatcher::new());
        let r = spawn_receiver(Arc::clone(&receiver), bus.subscribe());
        let d = spawn_dispatcher(Arc::clone(&dispatcher), bus.subscribe());

        bus.publish_local(Contract::new(1, vec![resource("a", "/ns/a", &["t1"])]));
        bus.close();
        r.await.unwrap();
        d.await.unwrap();

        assert_eq!(receiver.route_count(), 0);
        assert_eq!(dispatcher.consumer_count(), 0);
        assert_eq!(receiver.generation(), Some(2));
    }
}
