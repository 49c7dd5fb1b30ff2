//! Custom Resource Definitions for Kafka eventing
//!
//! Four routing resources feed the contract: `KafkaBroker`, `KafkaTrigger`,
//! `KafkaChannel` and `KafkaSink`. `KafkaConsumerGroup` is the internal
//! resource through which the dispatchers learn which consumer groups to run.

use kube::CustomResource;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

/// API group of all Kafka eventing resources
pub const API_GROUP: &str = "eventing.kafka.dev";

/// Regex for validating Kubernetes names (RFC 1123 label)
static NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());

/// Regex for validating Kafka topic names
static TOPIC_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9._-]+$").unwrap());

/// Validate a Kubernetes name (RFC 1123 label)
fn validate_k8s_name(value: &str) -> Result<(), ValidationError> {
    if value.len() > 63 {
        return Err(
            ValidationError::new("name_too_long").with_message("name exceeds 63 characters".into())
        );
    }
    if !NAME_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_name").with_message(
            format!("'{}' is not a valid Kubernetes name (RFC 1123)", value).into(),
        ));
    }
    Ok(())
}

/// Validate a Kafka topic name
fn validate_topic(value: &str) -> Result<(), ValidationError> {
    if value.len() > 249 {
        return Err(ValidationError::new("topic_too_long")
            .with_message("topic name exceeds 249 characters".into()));
    }
    if value == "." || value == ".." || !TOPIC_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_topic")
            .with_message(format!("'{}' is not a valid Kafka topic name", value).into()));
    }
    Ok(())
}

/// Validate a subscriber or sink URI
fn validate_uri(value: &str) -> Result<(), ValidationError> {
    if value.starts_with("http://") || value.starts_with("https://") {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_uri")
            .with_message(format!("'{}' must be an http(s) URI", value).into()))
    }
}

/// Validate comma separated `host:port` bootstrap servers
fn validate_bootstrap_servers(value: &str) -> Result<(), ValidationError> {
    let valid = !value.is_empty()
        && value.split(',').all(|server| {
            server
                .trim()
                .rsplit_once(':')
                .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
        });
    if valid {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_bootstrap_servers")
            .with_message(format!("'{}' is not a list of host:port", value).into()))
    }
}

/// Retry and dead-letter settings
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DeliverySpec {
    /// Dead letter sink URI
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_uri"))]
    pub dead_letter_sink: Option<String>,

    /// Number of retries (0-100)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(max = 100, message = "retry must be at most 100"))]
    pub retry: Option<u32>,

    /// `exponential` or `linear`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_policy: Option<BackoffPolicySpec>,

    /// Base backoff delay in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_delay_ms: Option<u64>,

    /// Per-request timeout in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Backoff strategy between retries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum BackoffPolicySpec {
    #[default]
    Exponential,
    Linear,
}

// ============================================================================
// KafkaBroker
// ============================================================================

/// Kafka-backed broker: one topic, one ingress path, many triggers.
///
/// ```yaml
/// apiVersion: eventing.kafka.dev/v1alpha1
/// kind: KafkaBroker
/// metadata:
///   name: default
///   namespace: events
/// spec:
///   bootstrapServers: my-cluster-kafka-bootstrap.kafka:9092
/// ```
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "eventing.kafka.dev",
    version = "v1alpha1",
    kind = "KafkaBroker",
    plural = "kafkabrokers",
    shortname = "kb",
    namespaced,
    status = "RoutingStatus",
    printcolumn = r#"{"name":"Address","type":"string","jsonPath":".status.address"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Contract","type":"integer","jsonPath":".status.observedContractGeneration"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KafkaBrokerSpec {
    /// Topic backing the broker; defaults to `knative-broker-<namespace>-<name>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_topic"))]
    pub topic: Option<String>,

    /// Kafka bootstrap servers; defaults to the operator-wide setting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_bootstrap_servers"))]
    pub bootstrap_servers: Option<String>,

    /// Default delivery settings for all triggers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub delivery: Option<DeliverySpec>,
}

// ============================================================================
// KafkaTrigger
// ============================================================================

/// Subscription of a URI to the events of a `KafkaBroker`
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "eventing.kafka.dev",
    version = "v1alpha1",
    kind = "KafkaTrigger",
    plural = "kafkatriggers",
    shortname = "kt",
    namespaced,
    status = "RoutingStatus",
    printcolumn = r#"{"name":"Broker","type":"string","jsonPath":".spec.broker"}"#,
    printcolumn = r#"{"name":"Subscriber","type":"string","jsonPath":".spec.subscriber"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KafkaTriggerSpec {
    /// Name of the broker in the trigger's namespace
    #[validate(custom(function = "validate_k8s_name"))]
    pub broker: String,

    /// Destination URI
    #[validate(custom(function = "validate_uri"))]
    pub subscriber: String,

    /// Where replies from the subscriber go
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_uri"))]
    pub reply: Option<String>,

    /// Per-trigger delivery override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub delivery: Option<DeliverySpec>,

    /// Dispatch in partition order instead of concurrently
    #[serde(default)]
    pub ordered: bool,
}

// ============================================================================
// KafkaChannel
// ============================================================================

/// Kafka-backed channel with inline subscribers
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "eventing.kafka.dev",
    version = "v1alpha1",
    kind = "KafkaChannel",
    plural = "kafkachannels",
    shortname = "kc",
    namespaced,
    status = "RoutingStatus",
    printcolumn = r#"{"name":"Address","type":"string","jsonPath":".status.address"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KafkaChannelSpec {
    /// Topic backing the channel; defaults to `knative-messaging-kafka.<namespace>.<name>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_topic"))]
    pub topic: Option<String>,

    /// Kafka bootstrap servers; defaults to the operator-wide setting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_bootstrap_servers"))]
    pub bootstrap_servers: Option<String>,

    /// Default delivery settings for all subscribers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub delivery: Option<DeliverySpec>,

    /// Channel subscribers
    #[serde(default)]
    #[validate(length(max = 1000, message = "maximum 1000 subscribers allowed"))]
    #[validate(nested)]
    pub subscribers: Vec<ChannelSubscriber>,
}

/// One subscriber of a channel
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSubscriber {
    /// Stable identity of the subscription
    #[validate(length(min = 1, message = "subscriber uid must not be empty"))]
    pub uid: String,

    /// Destination URI
    #[validate(custom(function = "validate_uri"))]
    pub subscriber_uri: String,

    /// Reply URI
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_uri"))]
    pub reply_uri: Option<String>,

    /// Per-subscriber delivery override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub delivery: Option<DeliverySpec>,
}

// ============================================================================
// KafkaSink
// ============================================================================

/// HTTP-to-Kafka sink: an ingress that writes straight into a topic
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "eventing.kafka.dev",
    version = "v1alpha1",
    kind = "KafkaSink",
    plural = "kafkasinks",
    shortname = "ks",
    namespaced,
    status = "RoutingStatus",
    printcolumn = r#"{"name":"Topic","type":"string","jsonPath":".spec.topic"}"#,
    printcolumn = r#"{"name":"Address","type":"string","jsonPath":".status.address"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KafkaSinkSpec {
    /// Destination topic
    #[validate(custom(function = "validate_topic"))]
    pub topic: String,

    /// Kafka bootstrap servers; defaults to the operator-wide setting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_bootstrap_servers"))]
    pub bootstrap_servers: Option<String>,
}

// ============================================================================
// KafkaConsumerGroup (internal)
// ============================================================================

/// Consumer group run by the dispatchers on behalf of a trigger
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "eventing.kafka.dev",
    version = "v1alpha1",
    kind = "KafkaConsumerGroup",
    plural = "kafkaconsumergroups",
    shortname = "kcg",
    namespaced,
    status = "ConsumerGroupStatus",
    printcolumn = r#"{"name":"Group","type":"string","jsonPath":".spec.groupId"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KafkaConsumerGroupSpec {
    /// Kafka consumer group id
    pub group_id: String,

    /// Topics the group consumes
    pub topics: Vec<String>,

    /// Kafka bootstrap servers
    pub bootstrap_servers: String,

    /// Where consumed events are dispatched
    pub subscriber: String,
}

/// Status of a consumer group
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerGroupStatus {
    /// Whether the dispatchers joined the group
    #[serde(default)]
    pub ready: bool,
}

// ============================================================================
// Shared status
// ============================================================================

/// Status shared by all routing resources
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RoutingStatus {
    /// Ready, Pending or Failed
    #[serde(default)]
    pub phase: String,

    /// Human-readable message about current state
    #[serde(default)]
    pub message: String,

    /// URL events are accepted on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Observed generation for tracking spec changes
    #[serde(default)]
    pub observed_generation: i64,

    /// Contract generation the resource was last published in
    #[serde(default)]
    pub observed_contract_generation: u64,

    /// Consumer group serving a trigger
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_group: Option<String>,

    /// Conditions for detailed status tracking
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Last time the status was written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<String>,
}

/// Condition for tracking resource status
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Ready, ConsumerGroupReady
    pub r#type: String,

    /// True, False, Unknown
    pub status: String,

    /// Machine-readable reason
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last transition time
    pub last_transition_time: String,
}

impl Condition {
    /// Build a condition stamped with the current time
    pub fn new(r#type: &str, status: bool, reason: &str, message: impl Into<String>) -> Self {
        Self {
            r#type: r#type.to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            reason: reason.to_string(),
            message: message.into(),
            last_transition_time: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Turn validator errors into one message, as the controllers report them
pub fn validation_message(errors: &validator::ValidationErrors) -> String {
    let mut messages: Vec<String> = errors
        .field_errors()
        .iter()
        .flat_map(|(field, errs)| {
            errs.iter().map(move |e| match &e.message {
                Some(message) => format!("{}: {}", field, message),
                None => format!("{}: {}", field, e.code),
            })
        })
        .collect();
    messages.sort();
    messages.join("; ")
}
