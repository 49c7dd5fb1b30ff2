//! Consumer groups for triggers
//!
//! Every relevant trigger gets a Kafka consumer group. The group is created
//! when the trigger appears, replaced when its identity (group id, topics or
//! cluster) changes and deleted before the trigger is allowed to go away.
//! Deletion is guarded by a finalizer that is only removed after the group
//! is gone, so a failed teardown is simply retried by the next reconcile.

use crate::crd::{KafkaConsumerGroup, KafkaConsumerGroupSpec, KafkaTrigger};
use crate::error::{OperatorError, Result};
use crate::publisher::FIELD_MANAGER;
use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::{Client, Resource};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Finalizer guarding trigger deletion
pub const TRIGGER_FINALIZER: &str = "kafka.triggers.eventing.knative.dev";

/// Label linking a consumer group to the trigger that owns it
pub const TRIGGER_UID_LABEL: &str = "eventing.kafka.dev/trigger-uid";

/// Identity of the trigger owning a group
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TriggerRef {
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

/// Desired or observed consumer group of a trigger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerGroupBinding {
    pub owner: TriggerRef,
    pub group_id: String,
    pub topics: Vec<String>,
    pub bootstrap_servers: String,
    pub subscriber: String,
}

impl ConsumerGroupBinding {
    /// Whether both bindings describe the same Kafka group. A group that
    /// differs only in its subscriber can be updated in place.
    pub fn same_identity(&self, other: &ConsumerGroupBinding) -> bool {
        self.group_id == other.group_id
            && self.topics == other.topics
            && self.bootstrap_servers == other.bootstrap_servers
    }
}

/// Kafka admin capability used by the reconciler
#[async_trait]
pub trait ConsumerGroupAdmin: Send + Sync + 'static {
    /// Group currently owned by `owner`, if any
    async fn binding(&self, owner: &TriggerRef) -> Result<Option<ConsumerGroupBinding>>;

    /// Create the group or update it in place
    async fn apply(&self, binding: &ConsumerGroupBinding) -> Result<()>;

    /// Delete the group. Deleting a missing group succeeds.
    async fn delete(&self, binding: &ConsumerGroupBinding) -> Result<()>;
}

/// Admin keeping groups in memory, for standalone runs and tests
#[derive(Debug, Default)]
pub struct InMemoryAdmin {
    groups: DashMap<String, ConsumerGroupBinding>,
}

impl InMemoryAdmin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Group owned by the trigger with `uid`
    pub fn group(&self, uid: &str) -> Option<ConsumerGroupBinding> {
        self.groups.get(uid).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

#[async_trait]
impl ConsumerGroupAdmin for InMemoryAdmin {
    async fn binding(&self, owner: &TriggerRef) -> Result<Option<ConsumerGroupBinding>> {
        Ok(self.group(&owner.uid))
    }

    async fn apply(&self, binding: &ConsumerGroupBinding) -> Result<()> {
        self.groups
            .insert(binding.owner.uid.clone(), binding.clone());
        Ok(())
    }

    async fn delete(&self, binding: &ConsumerGroupBinding) -> Result<()> {
        self.groups.remove(&binding.owner.uid);
        Ok(())
    }
}

/// Admin materializing groups as `KafkaConsumerGroup` resources owned by
/// their trigger; dispatchers join the groups they find there
#[derive(Clone)]
pub struct KubeConsumerGroupAdmin {
    client: Client,
}

impl KubeConsumerGroupAdmin {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<KafkaConsumerGroup> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn admin_error(e: kube::Error) -> OperatorError {
    OperatorError::ConsumerGroupError(e.to_string())
}

fn consumer_group_resource(binding: &ConsumerGroupBinding) -> KafkaConsumerGroup {
    let owner = &binding.owner;
    let mut group = KafkaConsumerGroup::new(
        &owner.name,
        KafkaConsumerGroupSpec {
            group_id: binding.group_id.clone(),
            topics: binding.topics.clone(),
            bootstrap_servers: binding.bootstrap_servers.clone(),
            subscriber: binding.subscriber.clone(),
        },
    );
    group.metadata.namespace = Some(owner.namespace.clone());
    group.metadata.labels = Some(BTreeMap::from([
        (TRIGGER_UID_LABEL.to_string(), owner.uid.clone()),
        (
            "app.kubernetes.io/managed-by".to_string(),
            FIELD_MANAGER.to_string(),
        ),
    ]));
    group.metadata.owner_references = Some(vec![OwnerReference {
        api_version: KafkaTrigger::api_version(&()).to_string(),
        kind: KafkaTrigger::kind(&()).to_string(),
        name: owner.name.clone(),
        uid: owner.uid.clone(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }]);
    group
}

#[async_trait]
impl ConsumerGroupAdmin for KubeConsumerGroupAdmin {
    async fn binding(&self, owner: &TriggerRef) -> Result<Option<ConsumerGroupBinding>> {
        let Some(group) = self
            .api(&owner.namespace)
            .get_opt(&owner.name)
            .await
            .map_err(admin_error)?
        else {
            return Ok(None);
        };

        let owned = group
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(TRIGGER_UID_LABEL))
            .is_some_and(|uid| *uid == owner.uid);
        if !owned {
            return Ok(None);
        }

        Ok(Some(ConsumerGroupBinding {
            owner: owner.clone(),
            group_id: group.spec.group_id,
            topics: group.spec.topics,
            bootstrap_servers: group.spec.bootstrap_servers,
            subscriber: group.spec.subscriber,
        }))
    }

    async fn apply(&self, binding: &ConsumerGroupBinding) -> Result<()> {
        let params = PatchParams::apply(FIELD_MANAGER).force();
        self.api(&binding.owner.namespace)
            .patch(
                &binding.owner.name,
                &params,
                &Patch::Apply(&consumer_group_resource(binding)),
            )
            .await
            .map_err(admin_error)?;
        Ok(())
    }

    async fn delete(&self, binding: &ConsumerGroupBinding) -> Result<()> {
        match self
            .api(&binding.owner.namespace)
            .delete(&binding.owner.name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(admin_error(e)),
        }
    }
}

/// What happened to a trigger's group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupAction {
    Created,
    Updated,
    Unchanged,
    /// Identity changed: old group deleted, new one created
    Recreated,
    Deleted,
    /// Nothing to delete
    Absent,
}

/// Trigger facts the lifecycle depends on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerView {
    pub owner: TriggerRef,
    pub deleting: bool,
    pub has_finalizer: bool,
    /// Whether the trigger belongs to a broker this operator serves
    pub relevant: bool,
}

impl TriggerView {
    pub fn from_trigger(trigger: &KafkaTrigger, relevant: bool) -> Result<Self> {
        let meta = trigger.meta();
        let owner = TriggerRef {
            namespace: meta.namespace.clone().unwrap_or_else(|| "default".to_string()),
            name: meta.name.clone().unwrap_or_default(),
            uid: meta.uid.clone().ok_or_else(|| {
                OperatorError::InvalidConfig("trigger has no uid".to_string())
            })?,
        };
        Ok(Self {
            owner,
            deleting: meta.deletion_timestamp.is_some(),
            has_finalizer: meta
                .finalizers
                .iter()
                .flatten()
                .any(|f| f == TRIGGER_FINALIZER),
            relevant,
        })
    }
}

/// Next lifecycle step for a trigger; the caller persists finalizer changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Not ours and never was
    Ignored,
    /// Add the finalizer before touching any group
    AddFinalizer,
    Reconciled(GroupAction),
    /// Group is gone; the finalizer may be removed
    RemoveFinalizer(GroupAction),
    /// Deleting and already released
    Released,
}

/// Drives each trigger's consumer group toward its desired state
pub struct ConsumerGroupReconciler<A: ConsumerGroupAdmin> {
    admin: A,
}

impl<A: ConsumerGroupAdmin> ConsumerGroupReconciler<A> {
    pub fn new(admin: A) -> Self {
        Self { admin }
    }

    pub fn admin(&self) -> &A {
        &self.admin
    }

    /// Advance `trigger` by one step.
    ///
    /// Safe to call repeatedly: each step is re-entrant, and an error leaves
    /// the finalizer in place for the next attempt.
    pub async fn advance(
        &self,
        trigger: &TriggerView,
        desired: &ConsumerGroupBinding,
    ) -> Result<Transition> {
        match (trigger.deleting, trigger.has_finalizer) {
            (_, false) if !trigger.relevant => Ok(Transition::Ignored),
            (true, false) => Ok(Transition::Released),
            (false, false) => Ok(Transition::AddFinalizer),
            (false, true) => Ok(Transition::Reconciled(self.reconcile(desired).await?)),
            (true, true) => Ok(Transition::RemoveFinalizer(
                self.finalize(&trigger.owner).await?,
            )),
        }
    }

    /// Make the owner's group match `desired`
    pub async fn reconcile(&self, desired: &ConsumerGroupBinding) -> Result<GroupAction> {
        let action = match self.admin.binding(&desired.owner).await? {
            None => {
                self.admin.apply(desired).await?;
                GroupAction::Created
            }
            Some(current) if current == *desired => GroupAction::Unchanged,
            Some(current) if current.same_identity(desired) => {
                self.admin.apply(desired).await?;
                GroupAction::Updated
            }
            Some(current) => {
                self.admin.delete(&current).await?;
                self.admin.apply(desired).await?;
                GroupAction::Recreated
            }
        };

        match action {
            GroupAction::Unchanged => debug!(group = %desired.group_id, "Consumer group up to date"),
            _ => info!(
                group = %desired.group_id,
                trigger = %desired.owner.name,
                namespace = %desired.owner.namespace,
                action = ?action,
                "Consumer group reconciled"
            ),
        }
        Ok(action)
    }

    /// Delete the owner's group, if it has one
    pub async fn finalize(&self, owner: &TriggerRef) -> Result<GroupAction> {
        match self.admin.binding(owner).await? {
            Some(current) => {
                self.admin.delete(&current).await?;
                info!(
                    group = %current.group_id,
                    trigger = %owner.name,
                    namespace = %owner.namespace,
                    "Consumer group deleted"
                );
                Ok(GroupAction::Deleted)
            }
            None => Ok(GroupAction::Absent),
        }
    }
}
