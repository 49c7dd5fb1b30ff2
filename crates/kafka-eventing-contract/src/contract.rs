//! Routing contract data model
//!
//! The [`Contract`] is the full routing topology at one point in time. It is
//! serialized as JSON into shared storage. Readers ignore unknown fields and
//! default missing ones, so older replicas keep decoding payloads produced
//! by newer control planes.
//!
//! ```json
//! {
//!   "generation": 7,
//!   "resources": [
//!     {
//!       "uid": "0b7c...",
//!       "topics": ["knative-broker-default-orders"],
//!       "bootstrapServers": "kafka:9092",
//!       "ingress": { "path": "/default/orders" },
//!       "egresses": [
//!         {
//!           "uid": "9f1e...",
//!           "consumerGroup": "knative-trigger-default-audit",
//!           "destination": "http://audit.default.svc.cluster.local"
//!         }
//!       ],
//!       "reference": { "uuid": "0b7c...", "namespace": "default", "name": "orders", "kind": "KafkaBroker" }
//!     }
//!   ]
//! }
//! ```

use crate::error::{ContractError, Result};
use serde::{Deserialize, Serialize};

/// Generation-stamped routing topology
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contract {
    /// Monotonically increasing version, unique per distinct content
    #[serde(default)]
    pub generation: u64,

    /// Routing entries, ordered by resource UID
    #[serde(default)]
    pub resources: Vec<Resource>,
}

impl Contract {
    /// Create a contract with the given generation and resources
    pub fn new(generation: u64, resources: Vec<Resource>) -> Self {
        Self {
            generation,
            resources,
        }
    }

    /// The drain contract: no routing entries at all.
    ///
    /// Publishing it tells every subscriber to route everything away. It
    /// carries a real generation so generation-based deduplication treats it
    /// like any other update.
    pub fn drain(generation: u64) -> Self {
        Self {
            generation,
            resources: Vec::new(),
        }
    }

    /// Whether the contract holds no routing entries
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Field-by-field content comparison that ignores the generation
    pub fn same_content(&self, other: &Contract) -> bool {
        self.resources == other.resources
    }

    /// Look up a routing entry by resource UID
    pub fn resource(&self, uid: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.uid == uid)
    }

    /// Total number of egresses across all resources
    pub fn egress_count(&self) -> usize {
        self.resources.iter().map(|r| r.egresses.len()).sum()
    }

    /// Serialize into the shared storage wire format
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(ContractError::Encode)
    }

    /// Parse a payload read from shared storage.
    ///
    /// An empty or whitespace-only payload is rejected rather than decoded as
    /// the default contract, so a truncated write is never mistaken for a
    /// drain.
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(ContractError::EmptyPayload);
        }
        serde_json::from_slice(raw).map_err(ContractError::Decode)
    }
}

/// One routing entry: a broker, channel or sink and its subscribers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    /// UID of the owning cluster resource
    pub uid: String,

    /// Kafka topics backing this resource
    #[serde(default)]
    pub topics: Vec<String>,

    /// Comma separated Kafka bootstrap servers
    #[serde(default)]
    pub bootstrap_servers: String,

    /// Ingress the receivers must expose, if the resource accepts events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<Ingress>,

    /// Default delivery settings for all egresses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub egress_config: Option<EgressConfig>,

    /// Subscribers consuming from the resource's topics
    #[serde(default)]
    pub egresses: Vec<Egress>,

    /// Identity of the owning cluster resource
    #[serde(default)]
    pub reference: Reference,
}

/// Ingress exposed by the receivers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ingress {
    /// HTTP path the receiver serves for this resource
    #[serde(default)]
    pub path: String,

    /// Virtual host, when routing by host instead of path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

/// A subscriber bound to a consumer group
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Egress {
    /// UID of the subscribing resource (trigger or subscription)
    pub uid: String,

    /// Kafka consumer group reading on behalf of the subscriber
    pub consumer_group: String,

    /// Subscriber URL
    pub destination: String,

    /// Where replies are sent, if anywhere
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_url: Option<String>,

    /// Per-egress override of the resource's delivery settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub egress_config: Option<EgressConfig>,

    /// Ordering guarantee for dispatch
    #[serde(default)]
    pub delivery_order: DeliveryOrder,

    /// Identity of the subscribing resource
    #[serde(default)]
    pub reference: Reference,
}

/// Retry and dead-letter settings for dispatch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EgressConfig {
    /// Dead letter sink URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_letter: Option<String>,

    /// Number of retries before giving up
    #[serde(default)]
    pub retry: u32,

    /// Backoff strategy between retries
    #[serde(default)]
    pub backoff_policy: BackoffPolicy,

    /// Base backoff delay in milliseconds
    #[serde(default)]
    pub backoff_delay_ms: u64,

    /// Per-request timeout in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Backoff strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BackoffPolicy {
    #[default]
    Exponential,
    Linear,
}

/// Dispatch ordering
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeliveryOrder {
    #[default]
    Unordered,
    Ordered,
}

/// Reference to the cluster resource a routing entry came from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reference {
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: String,
}
