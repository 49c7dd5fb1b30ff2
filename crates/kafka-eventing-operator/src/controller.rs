//! Kubernetes controllers
//!
//! Brokers, channels and sinks contribute resource fragments, triggers
//! contribute egress fragments and own a consumer group. Every reconcile
//! feeds the shared [`ContractSync`] and reports the outcome in the object's
//! status. A global resync requeues every object of every kind.

use crate::consumer_group::{
    ConsumerGroupBinding, ConsumerGroupReconciler, GroupAction, KubeConsumerGroupAdmin,
    Transition, TriggerRef, TriggerView, TRIGGER_FINALIZER,
};
use crate::crd::{
    validation_message, Condition, KafkaBroker, KafkaChannel, KafkaSink, KafkaTrigger,
    RoutingStatus,
};
use crate::error::{OperatorError, Result};
use crate::fragment::{
    broker_topic, trigger_consumer_group, FragmentContext, RoutingSource,
};
use crate::publisher::ConfigMapStorage;
use crate::resync::ResyncSignal;
use crate::sync::{fragment_key, ContractSync, RouteState, SyncReport};
use chrono::Utc;
use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{self, finalizer, Event as FinalizerEvent};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::{self, Config};
use kube::runtime::WatchStreamExt;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};
use validator::{Validate, ValidationErrors};

/// Finalizer keeping brokers, channels and sinks until they left the contract
pub const ROUTING_FINALIZER: &str = "eventing.kafka.dev/contract";

/// Requeue interval for routed resources
const DEFAULT_REQUEUE_SECONDS: u64 = 300;

/// Requeue interval while waiting for readiness
const PENDING_REQUEUE_SECONDS: u64 = 15;

/// Requeue interval for error cases (base for exponential backoff)
const ERROR_REQUEUE_SECONDS: u64 = 30;

/// Maximum requeue delay for error backoff
const MAX_ERROR_REQUEUE_SECONDS: u64 = 600;

/// Contract synchronizer backed by the contract ConfigMap
pub type ClusterSync = ContractSync<ConfigMapStorage>;

/// Context shared by all controllers
pub struct ControllerContext {
    /// Kubernetes client
    pub client: Client,
    pub sync: Arc<ClusterSync>,
    pub fragments: FragmentContext,
    pub groups: ConsumerGroupReconciler<KubeConsumerGroupAdmin>,
    /// Metrics recorder (optional)
    pub metrics: Option<ControllerMetrics>,
    /// Per-object error retry counts for exponential backoff
    pub error_counts: DashMap<String, u32>,
}

impl ControllerContext {
    pub fn new(client: Client, sync: Arc<ClusterSync>, fragments: FragmentContext) -> Self {
        Self {
            groups: ConsumerGroupReconciler::new(KubeConsumerGroupAdmin::new(client.clone())),
            client,
            sync,
            fragments,
            metrics: Some(ControllerMetrics::new()),
            error_counts: DashMap::new(),
        }
    }
}

/// Metrics for the controllers
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
}

impl ControllerMetrics {
    pub fn new() -> Self {
        Self {
            reconciliations: metrics::counter!("kafka_eventing_reconciliations_total"),
            errors: metrics::counter!("kafka_eventing_reconciliation_errors_total"),
            duration: metrics::histogram!("kafka_eventing_reconciliation_duration_seconds"),
        }
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Cluster resources that contribute a fragment to the contract
pub trait RoutingResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + DeserializeOwned
    + Serialize
    + Send
    + Sync
    + 'static
{
    fn routing_source(self: Arc<Self>) -> RoutingSource;

    fn validate_spec(&self) -> std::result::Result<(), ValidationErrors>;

    fn routing_status(&self) -> Option<&RoutingStatus>;
}

impl RoutingResource for KafkaBroker {
    fn routing_source(self: Arc<Self>) -> RoutingSource {
        RoutingSource::Broker(self)
    }

    fn validate_spec(&self) -> std::result::Result<(), ValidationErrors> {
        self.spec.validate()
    }

    fn routing_status(&self) -> Option<&RoutingStatus> {
        self.status.as_ref()
    }
}

impl RoutingResource for KafkaChannel {
    fn routing_source(self: Arc<Self>) -> RoutingSource {
        RoutingSource::Channel(self)
    }

    fn validate_spec(&self) -> std::result::Result<(), ValidationErrors> {
        self.spec.validate()
    }

    fn routing_status(&self) -> Option<&RoutingStatus> {
        self.status.as_ref()
    }
}

impl RoutingResource for KafkaSink {
    fn routing_source(self: Arc<Self>) -> RoutingSource {
        RoutingSource::Sink(self)
    }

    fn validate_spec(&self) -> std::result::Result<(), ValidationErrors> {
        self.spec.validate()
    }

    fn routing_status(&self) -> Option<&RoutingStatus> {
        self.status.as_ref()
    }
}

impl RoutingResource for KafkaTrigger {
    fn routing_source(self: Arc<Self>) -> RoutingSource {
        RoutingSource::Trigger(self)
    }

    fn validate_spec(&self) -> std::result::Result<(), ValidationErrors> {
        self.spec.validate()
    }

    fn routing_status(&self) -> Option<&RoutingStatus> {
        self.status.as_ref()
    }
}

fn api<K: RoutingResource>(client: &Client, namespace: &Option<String>) -> Api<K> {
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

fn object_key<K: RoutingResource>(obj: &K) -> String {
    fragment_key(
        &K::kind(&()),
        &obj.namespace().unwrap_or_else(|| "default".to_string()),
        &obj.name_any(),
    )
}

/// Run every controller until their watches end
pub async fn run_controllers(
    ctx: Arc<ControllerContext>,
    namespace: Option<String>,
    resync: ResyncSignal,
) -> Result<()> {
    info!(
        namespace = namespace.as_deref().unwrap_or("all"),
        "Starting Kafka eventing controllers"
    );

    tokio::join!(
        run_routing_controller::<KafkaBroker>(ctx.clone(), namespace.clone(), resync.clone()),
        run_routing_controller::<KafkaChannel>(ctx.clone(), namespace.clone(), resync.clone()),
        run_routing_controller::<KafkaSink>(ctx.clone(), namespace.clone(), resync.clone()),
        run_trigger_controller(ctx, namespace, resync),
    );

    Ok(())
}

async fn run_routing_controller<K: RoutingResource>(
    ctx: Arc<ControllerContext>,
    namespace: Option<String>,
    resync: ResyncSignal,
) {
    let objects: Api<K> = api(&ctx.client, &namespace);
    info!(kind = %K::kind(&()), "Starting controller");

    Controller::new(objects, Config::default())
        .reconcile_all_on(resync.stream())
        .run(reconcile_routing::<K>, error_policy::<K>, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(
                        name = obj.name,
                        namespace = obj.namespace,
                        ?action,
                        "Reconciliation completed"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation failed");
                }
            }
        })
        .await;
}

async fn run_trigger_controller(
    ctx: Arc<ControllerContext>,
    namespace: Option<String>,
    resync: ResyncSignal,
) {
    let triggers: Api<KafkaTrigger> = api(&ctx.client, &namespace);
    let brokers: Api<KafkaBroker> = api(&ctx.client, &namespace);
    info!(kind = "KafkaTrigger", "Starting controller");

    let controller = Controller::new(triggers, Config::default());
    let store = controller.store();

    controller
        // A broker appearing or changing makes its triggers relevant.
        .watches(brokers, Config::default(), move |broker| {
            let namespace = broker.namespace();
            let name = broker.name_any();
            store
                .state()
                .into_iter()
                .filter(|trigger| trigger.namespace() == namespace && trigger.spec.broker == name)
                .map(|trigger| ObjectRef::from_obj(trigger.as_ref()))
                .collect::<Vec<_>>()
        })
        .reconcile_all_on(resync.stream())
        .run(reconcile_trigger, error_policy::<KafkaTrigger>, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(
                        name = obj.name,
                        namespace = obj.namespace,
                        ?action,
                        "Reconciliation completed"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation failed");
                }
            }
        })
        .await;
}

/// Reconcile a broker, channel or sink
#[instrument(skip(obj, ctx), fields(kind = %K::kind(&()), name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile_routing<K: RoutingResource>(
    obj: Arc<K>,
    ctx: Arc<ControllerContext>,
) -> Result<Action> {
    let start = Instant::now();

    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let key = object_key(obj.as_ref());
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let objects: Api<K> = Api::namespaced(ctx.client.clone(), &namespace);

    let result = finalizer(&objects, ROUTING_FINALIZER, obj, |event| async {
        match event {
            FinalizerEvent::Apply(obj) => apply_routing(obj, ctx.clone()).await,
            FinalizerEvent::Cleanup(obj) => cleanup_routing(obj, ctx.clone()).await,
        }
    })
    .await;

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
    }

    // Reset error backoff counter on success
    if result.is_ok() {
        ctx.error_counts.remove(&key);
    }

    result.map_err(|e| {
        if let Some(ref metrics) = ctx.metrics {
            metrics.errors.increment(1);
        }
        match e {
            finalizer::Error::ApplyFailed(e) | finalizer::Error::CleanupFailed(e) => e,
            other => OperatorError::FinalizerError(other.to_string()),
        }
    })
}

/// Put the object's fragment into the contract and report the outcome
async fn apply_routing<K: RoutingResource>(
    obj: Arc<K>,
    ctx: Arc<ControllerContext>,
) -> Result<Action> {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let key = object_key(obj.as_ref());
    let objects: Api<K> = Api::namespaced(ctx.client.clone(), &namespace);

    debug!(name = %name, namespace = %namespace, "Reconciling routing resource");

    if let Err(errors) = obj.validate_spec() {
        let message = validation_message(&errors);
        warn!(name = %name, errors = %message, "Spec validation failed");

        if ctx.sync.remove(&key) {
            ctx.sync.sync().await?;
        }
        let status = build_failed_status(obj.meta().generation, &message);
        update_status(&objects, &name, obj.routing_status(), status).await?;
        return Err(OperatorError::ValidationError(message));
    }

    let source = Arc::clone(&obj).routing_source();
    let uid = source.uid()?;
    let fragment = source.fragment(&ctx.fragments)?;
    let address = fragment.address().map(|a| a.url());
    ctx.sync.upsert(key, fragment);

    let report = ctx.sync.sync().await?;
    let state = report.state(&uid);
    let status = build_routing_status(
        obj.meta().generation,
        obj.routing_status(),
        &state,
        &report,
        address,
        ctx.sync.prober().config().warn_after_attempts,
    );
    update_status(&objects, &name, obj.routing_status(), status).await?;

    Ok(requeue_for(&state))
}

/// Take the object's fragment out of the contract
async fn cleanup_routing<K: RoutingResource>(
    obj: Arc<K>,
    ctx: Arc<ControllerContext>,
) -> Result<Action> {
    let key = object_key(obj.as_ref());
    info!(key = %key, "Removing routing resource from contract");

    if ctx.sync.remove(&key) {
        ctx.sync.sync().await?;
    }
    Ok(Action::await_change())
}

/// Reconcile a trigger and its consumer group
#[instrument(skip(trigger, ctx), fields(name = %trigger.name_any(), namespace = trigger.namespace()))]
async fn reconcile_trigger(trigger: Arc<KafkaTrigger>, ctx: Arc<ControllerContext>) -> Result<Action> {
    let start = Instant::now();

    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let key = object_key(trigger.as_ref());
    let result = apply_trigger(trigger, &ctx).await;

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
    }

    match result {
        Ok(action) => {
            ctx.error_counts.remove(&key);
            Ok(action)
        }
        Err(e) => {
            if let Some(ref metrics) = ctx.metrics {
                metrics.errors.increment(1);
            }
            Err(e)
        }
    }
}

async fn apply_trigger(trigger: Arc<KafkaTrigger>, ctx: &ControllerContext) -> Result<Action> {
    let name = trigger.name_any();
    let namespace = trigger.namespace().unwrap_or_else(|| "default".to_string());
    let key = object_key(trigger.as_ref());
    let triggers: Api<KafkaTrigger> = Api::namespaced(ctx.client.clone(), &namespace);
    let brokers: Api<KafkaBroker> = Api::namespaced(ctx.client.clone(), &namespace);

    let broker = brokers.get_opt(&trigger.spec.broker).await?;
    let view = TriggerView::from_trigger(&trigger, broker.is_some())?;

    if view.deleting {
        if ctx.sync.remove(&key) {
            ctx.sync.sync().await?;
        }
    } else if view.relevant || view.has_finalizer {
        if let Err(errors) = trigger.spec.validate() {
            let message = validation_message(&errors);
            warn!(name = %name, errors = %message, "Trigger spec validation failed");

            if ctx.sync.remove(&key) {
                ctx.sync.sync().await?;
            }
            let status = build_failed_status(trigger.metadata.generation, &message);
            update_status(&triggers, &name, trigger.status.as_ref(), status).await?;
            return Err(OperatorError::ValidationError(message));
        }
    }

    let desired = desired_binding(&trigger, &view.owner, broker.as_ref(), &ctx.fragments);
    match ctx.groups.advance(&view, &desired).await? {
        Transition::Ignored => {
            debug!(broker = %trigger.spec.broker, "Trigger does not reference a KafkaBroker, ignoring");
            Ok(Action::await_change())
        }
        Transition::AddFinalizer => {
            set_trigger_finalizer(&triggers, &trigger, true).await?;
            Ok(Action::await_change())
        }
        Transition::Reconciled(action) => {
            let fragment = Arc::clone(&trigger).routing_source().fragment(&ctx.fragments)?;
            ctx.sync.upsert(key, fragment);
            let report = ctx.sync.sync().await?;
            let state = report.state(&view.owner.uid);

            let mut status = build_routing_status(
                trigger.metadata.generation,
                trigger.status.as_ref(),
                &state,
                &report,
                None,
                ctx.sync.prober().config().warn_after_attempts,
            );
            status.consumer_group = Some(desired.group_id.clone());
            status.conditions.push(consumer_group_condition(action, &desired));
            update_status(&triggers, &name, trigger.status.as_ref(), status).await?;

            Ok(requeue_for(&state))
        }
        Transition::RemoveFinalizer(action) => {
            set_trigger_finalizer(&triggers, &trigger, false).await?;
            info!(name = %name, ?action, "Trigger released");
            Ok(Action::await_change())
        }
        Transition::Released => Ok(Action::await_change()),
    }
}

/// Consumer group a trigger should have
pub fn desired_binding(
    trigger: &KafkaTrigger,
    owner: &TriggerRef,
    broker: Option<&KafkaBroker>,
    ctx: &FragmentContext,
) -> ConsumerGroupBinding {
    let topic = broker
        .and_then(|b| b.spec.topic.clone())
        .unwrap_or_else(|| broker_topic(&owner.namespace, &trigger.spec.broker));
    let bootstrap_servers = broker
        .and_then(|b| b.spec.bootstrap_servers.clone())
        .unwrap_or_else(|| ctx.default_bootstrap_servers.clone());

    ConsumerGroupBinding {
        owner: owner.clone(),
        group_id: trigger_consumer_group(&owner.namespace, &owner.name),
        topics: vec![topic],
        bootstrap_servers,
        subscriber: trigger.spec.subscriber.clone(),
    }
}

async fn set_trigger_finalizer(
    api: &Api<KafkaTrigger>,
    trigger: &KafkaTrigger,
    present: bool,
) -> Result<()> {
    let mut finalizers: Vec<String> = trigger
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != TRIGGER_FINALIZER)
        .cloned()
        .collect();
    if present {
        finalizers.push(TRIGGER_FINALIZER.to_string());
    }

    // resourceVersion makes the patch fail on a concurrent finalizer change
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": trigger.resource_version(),
        }
    });
    api.patch(&trigger.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

fn requeue_for(state: &RouteState) -> Action {
    match state {
        RouteState::Routed => Action::requeue(Duration::from_secs(DEFAULT_REQUEUE_SECONDS)),
        _ => Action::requeue(Duration::from_secs(PENDING_REQUEUE_SECONDS)),
    }
}

/// Build the status of a routing resource from a sync report
pub(crate) fn build_routing_status(
    generation: Option<i64>,
    previous: Option<&RoutingStatus>,
    state: &RouteState,
    report: &SyncReport,
    address: Option<String>,
    warn_after_attempts: u32,
) -> RoutingStatus {
    let now = Utc::now().to_rfc3339();
    let previous_contract = previous.map_or(0, |s| s.observed_contract_generation);

    let (phase, reason, message, contract_generation) = match state {
        RouteState::Routed => (
            "Ready",
            "ContractPublished",
            format!("Published in contract generation {}", report.generation),
            report.generation,
        ),
        RouteState::Pending { failures } if *failures >= warn_after_attempts => (
            "Pending",
            "IngressNotReady",
            format!("Ingress still not ready after {} probes", failures),
            previous_contract,
        ),
        RouteState::Pending { .. } => (
            "Pending",
            "IngressNotReady",
            "Waiting for the ingress to become ready".to_string(),
            previous_contract,
        ),
        RouteState::Detached => (
            "Pending",
            "BrokerNotReady",
            "Waiting for the broker to become ready".to_string(),
            previous_contract,
        ),
        RouteState::Unknown => (
            "Pending",
            "NotInContract",
            "Not yet part of the contract".to_string(),
            previous_contract,
        ),
    };

    RoutingStatus {
        phase: phase.to_string(),
        message: message.clone(),
        address,
        observed_generation: generation.unwrap_or(0),
        observed_contract_generation: contract_generation,
        consumer_group: None,
        conditions: vec![Condition::new(
            "Ready",
            *state == RouteState::Routed,
            reason,
            message,
        )],
        last_sync_time: Some(now),
    }
}

/// Build a failed status
pub(crate) fn build_failed_status(generation: Option<i64>, error_msg: &str) -> RoutingStatus {
    RoutingStatus {
        phase: "Failed".to_string(),
        message: error_msg.to_string(),
        address: None,
        observed_generation: generation.unwrap_or(0),
        observed_contract_generation: 0,
        consumer_group: None,
        conditions: vec![Condition::new("Ready", false, "ValidationFailed", error_msg)],
        last_sync_time: Some(Utc::now().to_rfc3339()),
    }
}

fn consumer_group_condition(action: GroupAction, binding: &ConsumerGroupBinding) -> Condition {
    let reason = match action {
        GroupAction::Created => "Created",
        GroupAction::Updated => "Updated",
        GroupAction::Recreated => "Recreated",
        _ => "UpToDate",
    };
    Condition::new(
        "ConsumerGroupReady",
        true,
        reason,
        format!("Consumer group {} is ready", binding.group_id),
    )
}

/// Whether `next` says anything `previous` does not, ignoring timestamps
pub(crate) fn status_changed(previous: Option<&RoutingStatus>, next: &RoutingStatus) -> bool {
    let Some(previous) = previous else {
        return true;
    };
    let conditions = |s: &RoutingStatus| {
        s.conditions
            .iter()
            .map(|c| (c.r#type.clone(), c.status.clone(), c.reason.clone(), c.message.clone()))
            .collect::<Vec<_>>()
    };

    previous.phase != next.phase
        || previous.message != next.message
        || previous.address != next.address
        || previous.observed_generation != next.observed_generation
        || previous.observed_contract_generation != next.observed_contract_generation
        || previous.consumer_group != next.consumer_group
        || conditions(previous) != conditions(next)
}

async fn update_status<K: RoutingResource>(
    api: &Api<K>,
    name: &str,
    previous: Option<&RoutingStatus>,
    status: RoutingStatus,
) -> Result<()> {
    // Unchanged statuses are skipped; every write would trigger another
    // reconcile of the same object.
    if !status_changed(previous, &status) {
        return Ok(());
    }

    debug!(name = %name, phase = %status.phase, "Updating status");

    let patch = serde_json::json!({
        "status": status
    });
    api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(OperatorError::from)?;

    Ok(())
}

/// Backoff for the `retries`-th consecutive failure:
/// 30s → 60s → 120s → 240s → 480s → 600s (capped)
fn error_backoff(retries: u32) -> Duration {
    let base = Duration::from_secs(ERROR_REQUEUE_SECONDS);
    let backoff = base * 2u32.saturating_pow(retries.saturating_sub(1).min(5));
    backoff.min(Duration::from_secs(MAX_ERROR_REQUEUE_SECONDS))
}

fn error_policy<K: RoutingResource>(
    obj: Arc<K>,
    error: &OperatorError,
    ctx: Arc<ControllerContext>,
) -> Action {
    let key = object_key(obj.as_ref());
    let retries = {
        let mut entry = ctx.error_counts.entry(key.clone()).or_insert(0);
        *entry += 1;
        *entry
    };

    let delay = error.requeue_delay().unwrap_or_else(|| error_backoff(retries));

    warn!(
        error = %error,
        retry = retries,
        delay_secs = delay.as_secs(),
        "Reconciliation error for '{}', will retry",
        key
    );

    Action::requeue(delay)
}

/// Watch the contract ConfigMap and restore it when it is deleted
pub async fn watch_contract_storage(
    client: Client,
    sync: Arc<ClusterSync>,
    resync: ResyncSignal,
) {
    let storage = sync.publisher().storage();
    let api: Api<ConfigMap> = Api::namespaced(client, storage.namespace());
    let config = watcher::Config::default().fields(&format!("metadata.name={}", storage.name()));
    let mut events = watcher::watcher(api, config).default_backoff().boxed();

    while let Some(event) = events.next().await {
        match event {
            Ok(watcher::Event::Delete(_)) => {
                warn!("Contract ConfigMap deleted, recreating");
                if let Err(e) = sync.recover_storage().await {
                    error!(error = %e, "Failed to restore contract ConfigMap");
                }
                resync.trigger("contract storage deleted");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Contract ConfigMap watch error"),
        }
    }
}
