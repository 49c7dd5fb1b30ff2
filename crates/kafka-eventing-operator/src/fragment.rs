//! Routing fragments
//!
//! Every routing resource contributes one fragment to the contract. Brokers,
//! channels and sinks contribute a resource entry together with the address
//! the prober must see ready before the entry is admitted. Triggers
//! contribute an egress attached to their broker.

use crate::config::{service_hostname, IngressConfig};
use crate::crd::{
    BackoffPolicySpec, DeliverySpec, KafkaBroker, KafkaChannel, KafkaSink, KafkaTrigger,
};
use crate::error::{OperatorError, Result};
use chrono::{DateTime, Utc};
use kafka_eventing_contract::{
    BackoffPolicy, DeliveryOrder, Egress, EgressConfig, Ingress, Reference, Resource,
};
use kube::Resource as KubeResource;
use std::fmt;
use std::sync::Arc;

/// Suffix of the per-channel service name
pub const CHANNEL_SERVICE_SUFFIX: &str = "-kn-channel";

/// Longest Kubernetes resource name
pub const MAX_RESOURCE_NAME_LENGTH: usize = 63;

/// Service name for a channel, falling back to the bare name when the
/// suffixed form would be too long
pub fn channel_service_name(name: &str) -> String {
    if name.len() + CHANNEL_SERVICE_SUFFIX.len() > MAX_RESOURCE_NAME_LENGTH {
        name.to_string()
    } else {
        format!("{}{}", name, CHANNEL_SERVICE_SUFFIX)
    }
}

/// Ingress path of a routing resource
pub fn ingress_path(namespace: &str, name: &str) -> String {
    format!("/{}/{}", namespace, name)
}

/// Default topic of a broker
pub fn broker_topic(namespace: &str, name: &str) -> String {
    format!("knative-broker-{}-{}", namespace, name)
}

/// Default topic of a channel
pub fn channel_topic(namespace: &str, name: &str) -> String {
    format!("knative-messaging-kafka.{}.{}", namespace, name)
}

/// Consumer group of a trigger; stable across restarts
pub fn trigger_consumer_group(namespace: &str, name: &str) -> String {
    format!("knative-trigger-{}-{}", namespace, name)
}

/// Address the prober checks before a resource is admitted
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CandidateAddress {
    pub host: String,
    pub port: u16,
    /// HTTP path probed on the receiver
    pub path: String,
    /// Validated against the prober's active trust roots when set
    pub tls: bool,
}

impl CandidateAddress {
    pub fn plain(host: impl Into<String>, port: u16, path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            path: path.into(),
            tls: false,
        }
    }

    pub fn tls(host: impl Into<String>, port: u16, path: impl Into<String>) -> Self {
        Self {
            tls: true,
            ..Self::plain(host, port, path)
        }
    }

    /// URL form, as reported in resource status
    pub fn url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://{}:{}{}", scheme, self.host, self.port, self.path)
    }
}

impl fmt::Display for CandidateAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

/// Identity of the resource an egress attaches to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParentRef {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ParentRef {
    /// Whether `reference` names this parent
    pub fn matches(&self, reference: &Reference) -> bool {
        reference.kind == self.kind
            && reference.namespace == self.namespace
            && reference.name == self.name
    }
}

/// Payload of a fragment
#[derive(Debug, Clone, PartialEq)]
pub enum FragmentKind {
    /// A routing entry gated on its candidate address
    Resource {
        resource: Resource,
        address: CandidateAddress,
    },
    /// A subscriber attached to a parent routing entry
    Egress { parent: ParentRef, egress: Egress },
}

/// One resource's contribution to the contract
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingFragment {
    /// UID of the contributing cluster resource
    pub uid: String,
    /// Last observed update of the contributing resource
    pub observed_at: DateTime<Utc>,
    pub kind: FragmentKind,
}

impl RoutingFragment {
    /// Candidate address, for resource fragments
    pub fn address(&self) -> Option<&CandidateAddress> {
        match &self.kind {
            FragmentKind::Resource { address, .. } => Some(address),
            FragmentKind::Egress { .. } => None,
        }
    }
}

/// Settings needed to turn cluster resources into fragments
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentContext {
    pub ingress: IngressConfig,
    pub default_bootstrap_servers: String,
}

/// The routing resource kinds, uniformly convertible into fragments
#[derive(Debug, Clone)]
pub enum RoutingSource {
    Broker(Arc<KafkaBroker>),
    Trigger(Arc<KafkaTrigger>),
    Channel(Arc<KafkaChannel>),
    Sink(Arc<KafkaSink>),
}

impl RoutingSource {
    /// Kind name as it appears in references
    pub fn kind(&self) -> &'static str {
        match self {
            RoutingSource::Broker(_) => "KafkaBroker",
            RoutingSource::Trigger(_) => "KafkaTrigger",
            RoutingSource::Channel(_) => "KafkaChannel",
            RoutingSource::Sink(_) => "KafkaSink",
        }
    }

    fn meta(&self) -> &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
        match self {
            RoutingSource::Broker(r) => r.meta(),
            RoutingSource::Trigger(r) => r.meta(),
            RoutingSource::Channel(r) => r.meta(),
            RoutingSource::Sink(r) => r.meta(),
        }
    }

    /// UID of the underlying resource
    pub fn uid(&self) -> Result<String> {
        self.meta().uid.clone().ok_or_else(|| {
            OperatorError::InvalidConfig(format!("{} {} has no uid", self.kind(), self.name()))
        })
    }

    pub fn name(&self) -> String {
        self.meta().name.clone().unwrap_or_default()
    }

    pub fn namespace(&self) -> String {
        self.meta()
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string())
    }

    /// Whether the resource is being deleted
    pub fn is_deleting(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    /// Latest update time recorded in the object metadata
    pub fn observed_at(&self) -> DateTime<Utc> {
        let meta = self.meta();
        meta.managed_fields
            .iter()
            .flatten()
            .filter_map(|field| field.time.as_ref().map(|t| t.0))
            .chain(meta.creation_timestamp.as_ref().map(|t| t.0))
            .max()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn reference(&self) -> Result<Reference> {
        Ok(Reference {
            uuid: self.uid()?,
            namespace: self.namespace(),
            name: self.name(),
            kind: self.kind().to_string(),
        })
    }

    /// Convert into a routing fragment
    pub fn fragment(&self, ctx: &FragmentContext) -> Result<RoutingFragment> {
        let uid = self.uid()?;
        let namespace = self.namespace();
        let name = self.name();
        let path = ingress_path(&namespace, &name);
        let address = candidate(&ctx.ingress, &path);

        let kind = match self {
            RoutingSource::Broker(broker) => FragmentKind::Resource {
                resource: Resource {
                    uid: uid.clone(),
                    topics: vec![broker
                        .spec
                        .topic
                        .clone()
                        .unwrap_or_else(|| broker_topic(&namespace, &name))],
                    bootstrap_servers: bootstrap(&broker.spec.bootstrap_servers, ctx),
                    ingress: Some(Ingress { path, host: None }),
                    egress_config: broker.spec.delivery.as_ref().map(egress_config),
                    egresses: Vec::new(),
                    reference: self.reference()?,
                },
                address,
            },
            RoutingSource::Channel(channel) => {
                let host = service_hostname(
                    &channel_service_name(&name),
                    &namespace,
                    &ctx.ingress.cluster_domain,
                );
                let mut egresses: Vec<Egress> = channel
                    .spec
                    .subscribers
                    .iter()
                    .map(|sub| Egress {
                        uid: sub.uid.clone(),
                        consumer_group: sub.uid.clone(),
                        destination: sub.subscriber_uri.clone(),
                        reply_url: sub.reply_uri.clone(),
                        egress_config: sub.delivery.as_ref().map(egress_config),
                        delivery_order: DeliveryOrder::Ordered,
                        reference: Reference {
                            uuid: sub.uid.clone(),
                            namespace: namespace.clone(),
                            name: name.clone(),
                            kind: "Subscription".to_string(),
                        },
                    })
                    .collect();
                egresses.sort_by(|a, b| a.uid.cmp(&b.uid));

                FragmentKind::Resource {
                    resource: Resource {
                        uid: uid.clone(),
                        topics: vec![channel
                            .spec
                            .topic
                            .clone()
                            .unwrap_or_else(|| channel_topic(&namespace, &name))],
                        bootstrap_servers: bootstrap(&channel.spec.bootstrap_servers, ctx),
                        ingress: Some(Ingress {
                            path,
                            host: Some(host),
                        }),
                        egress_config: channel.spec.delivery.as_ref().map(egress_config),
                        egresses,
                        reference: self.reference()?,
                    },
                    address,
                }
            }
            RoutingSource::Sink(sink) => FragmentKind::Resource {
                resource: Resource {
                    uid: uid.clone(),
                    topics: vec![sink.spec.topic.clone()],
                    bootstrap_servers: bootstrap(&sink.spec.bootstrap_servers, ctx),
                    ingress: Some(Ingress { path, host: None }),
                    egress_config: None,
                    egresses: Vec::new(),
                    reference: self.reference()?,
                },
                address,
            },
            RoutingSource::Trigger(trigger) => FragmentKind::Egress {
                parent: ParentRef {
                    kind: "KafkaBroker".to_string(),
                    namespace: namespace.clone(),
                    name: trigger.spec.broker.clone(),
                },
                egress: Egress {
                    uid: uid.clone(),
                    consumer_group: trigger_consumer_group(&namespace, &name),
                    destination: trigger.spec.subscriber.clone(),
                    reply_url: trigger.spec.reply.clone(),
                    egress_config: trigger.spec.delivery.as_ref().map(egress_config),
                    delivery_order: if trigger.spec.ordered {
                        DeliveryOrder::Ordered
                    } else {
                        DeliveryOrder::Unordered
                    },
                    reference: self.reference()?,
                },
            },
        };

        Ok(RoutingFragment {
            uid,
            observed_at: self.observed_at(),
            kind,
        })
    }
}

fn candidate(ingress: &IngressConfig, path: &str) -> CandidateAddress {
    if ingress.tls {
        CandidateAddress::tls(ingress.host(), ingress.port(), path)
    } else {
        CandidateAddress::plain(ingress.host(), ingress.port(), path)
    }
}

fn bootstrap(servers: &Option<String>, ctx: &FragmentContext) -> String {
    servers
        .clone()
        .unwrap_or_else(|| ctx.default_bootstrap_servers.clone())
}

fn egress_config(delivery: &DeliverySpec) -> EgressConfig {
    EgressConfig {
        dead_letter: delivery.dead_letter_sink.clone(),
        retry: delivery.retry.unwrap_or(0),
        backoff_policy: match delivery.backoff_policy.unwrap_or_default() {
            BackoffPolicySpec::Exponential => BackoffPolicy::Exponential,
            BackoffPolicySpec::Linear => BackoffPolicy::Linear,
        },
        backoff_delay_ms: delivery.backoff_delay_ms.unwrap_or(0),
        timeout_ms: delivery.timeout_ms,
    }
}
