//! Control plane to data plane: build, publish, watch and fan out

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kafka_eventing_contract::{Contract, MemoryStorage};
use kafka_eventing_dataplane::prelude::*;
use kafka_eventing_operator::config::{IngressConfig, ProberConfig};
use kafka_eventing_operator::crd::{KafkaBroker, KafkaBrokerSpec, KafkaTrigger, KafkaTriggerSpec};
use kafka_eventing_operator::prelude::*;
use kafka_eventing_operator::sync::fragment_key;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct TableTransport {
    ready: Mutex<HashSet<CandidateAddress>>,
}

#[async_trait]
impl ProbeTransport for TableTransport {
    async fn probe(&self, address: &CandidateAddress, _roots: &TrustRoots) -> bool {
        self.ready.lock().contains(address)
    }
}

fn prober(transport: Arc<TableTransport>) -> Prober {
    let config = ProberConfig {
        backoff_base: Duration::from_millis(5),
        backoff_max: Duration::from_millis(20),
        ..Default::default()
    };
    Prober::new(config, transport, TrustRoots::empty())
}

fn context() -> FragmentContext {
    FragmentContext {
        ingress: IngressConfig::default(),
        default_bootstrap_servers: "kafka:9092".to_string(),
    }
}

fn meta(name: &str, uid: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some("events".to_string()),
        uid: Some(uid.to_string()),
        ..Default::default()
    }
}

fn broker_source() -> RoutingSource {
    RoutingSource::Broker(Arc::new(KafkaBroker {
        metadata: meta("default", "broker-uid"),
        spec: KafkaBrokerSpec::default(),
        status: None,
    }))
}

fn trigger_source() -> RoutingSource {
    RoutingSource::Trigger(Arc::new(KafkaTrigger {
        metadata: meta("audit", "trigger-uid"),
        spec: KafkaTriggerSpec {
            broker: "default".to_string(),
            subscriber: "http://audit.events.svc".to_string(),
            ..Default::default()
        },
        status: None,
    }))
}

fn upsert(sync: &ContractSync<MemoryStorage>, source: &RoutingSource) -> RoutingFragment {
    let fragment = source.fragment(&context()).unwrap();
    sync.upsert(
        fragment_key(source.kind(), &source.namespace(), &source.name()),
        fragment.clone(),
    );
    fragment
}

async fn wait_for<F: Fn() -> bool>(check: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_ready_broker_reaches_data_plane() {
    let storage = MemoryStorage::new();
    let transport = Arc::new(TableTransport::default());
    let sync = ContractSync::start(storage.clone(), prober(transport.clone()))
        .await
        .unwrap();

    let bus = Arc::new(ContractBus::default());
    let receiver = Arc::new(Receiver::new());
    let dispatcher = Arc::new(Dispatcher::new());
    let receiver_task = spawn_receiver(Arc::clone(&receiver), bus.subscribe());
    let dispatcher_task = spawn_dispatcher(Arc::clone(&dispatcher), bus.subscribe());
    let watcher = ContractWatcher::new(storage.clone(), Arc::clone(&bus));
    watcher.start().unwrap();

    let broker = upsert(&sync, &broker_source());
    let report = sync.sync().await.unwrap();
    assert!(!report.published);
    assert!(storage.payload().is_none());

    let address = broker.address().cloned().unwrap();
    transport.ready.lock().insert(address.clone());
    wait_for(|| sync.prober().is_ready(&address)).await;

    let report = sync.sync().await.unwrap();
    assert_eq!(report.generation, 1);
    wait_for(|| receiver.generation() == Some(1)).await;
    let route = receiver.route("/events/default").unwrap();
    assert_eq!(route.topics, vec!["knative-broker-events-default".to_string()]);

    upsert(&sync, &trigger_source());
    let report = sync.sync().await.unwrap();
    assert_eq!(report.generation, 2);
    wait_for(|| dispatcher.consumer_count() == 1).await;
    assert_eq!(
        dispatcher.consumer("trigger-uid").unwrap().consumer_group,
        "knative-trigger-events-audit"
    );

    assert!(sync.close().await.unwrap());
    wait_for(|| receiver.generation() == Some(3)).await;
    assert_eq!(receiver.route_count(), 0);
    wait_for(|| dispatcher.consumer_count() == 0).await;

    watcher.close().await;
    bus.close();
    let _ = tokio::join!(receiver_task, dispatcher_task);
}

#[tokio::test]
async fn test_restart_resumes_without_regating() {
    let storage = MemoryStorage::new();
    let transport = Arc::new(TableTransport::default());
    let first = ContractSync::start(storage.clone(), prober(transport.clone()))
        .await
        .unwrap();

    let broker = upsert(&first, &broker_source());
    let address = broker.address().cloned().unwrap();
    transport.ready.lock().insert(address.clone());
    wait_for(|| first.prober().is_ready(&address)).await;
    assert_eq!(first.sync().await.unwrap().generation, 1);
    drop(first);

    // The ingress is unreachable after the restart, but the resource was
    // already admitted by the stored contract.
    transport.ready.lock().clear();
    let second = ContractSync::start(storage.clone(), prober(transport))
        .await
        .unwrap();
    assert_eq!(second.current().generation, 1);

    upsert(&second, &broker_source());
    let report = second.sync().await.unwrap();
    assert!(!report.changed);
    assert!(!report.published);
    assert_eq!(report.generation, 1);

    let stored = Contract::from_bytes(&storage.payload().unwrap()).unwrap();
    assert_eq!(stored.generation, 1);
    assert!(stored.resource("broker-uid").is_some());
}

#[tokio::test]
async fn test_consumer_group_lifecycle_in_memory() {
    let reconciler = ConsumerGroupReconciler::new(InMemoryAdmin::new());
    let RoutingSource::Trigger(trigger) = trigger_source() else {
        unreachable!()
    };

    let view = kafka_eventing_operator::consumer_group::TriggerView::from_trigger(&trigger, true)
        .unwrap();
    let desired = kafka_eventing_operator::controller::desired_binding(
        &trigger,
        &view.owner,
        None,
        &context(),
    );

    let action = reconciler.reconcile(&desired).await.unwrap();
    assert_eq!(
        action,
        kafka_eventing_operator::consumer_group::GroupAction::Created
    );
    assert_eq!(reconciler.admin().len(), 1);

    reconciler.finalize(&view.owner).await.unwrap();
    assert!(reconciler.admin().is_empty());
}
