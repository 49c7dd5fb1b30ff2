//! # Kafka eventing control plane
//!
//! Kubernetes operator that turns Kafka brokers, triggers, channels and sinks
//! into one versioned routing contract and publishes it for the data plane.
//!
//! ## Features
//!
//! - **Custom Resource Definitions**: `KafkaBroker`, `KafkaTrigger`,
//!   `KafkaChannel`, `KafkaSink` and the internal `KafkaConsumerGroup`
//! - **Readiness gating**: a resource enters the contract only once its
//!   ingress answers, probed in the background over HTTP or TLS
//! - **Trust root rotation**: a changed CA bundle invalidates every cached
//!   TLS result at once
//! - **Monotonic contracts**: a new generation is minted only when the
//!   routing content changes, and resumes from the stored contract after a
//!   restart
//! - **Consumer groups**: one group per trigger, kept until the trigger is
//!   deleted, behind a finalizer
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use kafka_eventing_operator::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = kube::Client::try_default().await?;
//!     let config = OperatorConfig::default();
//!
//!     let prober = Prober::new(config.prober.clone(), Arc::new(HttpProbeTransport), TrustRoots::empty());
//!     let storage = ConfigMapStorage::new(client.clone(), &config.system_namespace, &config.contract_config_map);
//!     let sync = Arc::new(ContractSync::start(storage, prober).await?);
//!
//!     let fragments = FragmentContext {
//!         ingress: config.ingress.clone(),
//!         default_bootstrap_servers: config.default_bootstrap_servers.clone(),
//!     };
//!     let ctx = Arc::new(ControllerContext::new(client, sync, fragments));
//!     run_controllers(ctx, None, ResyncSignal::new()).await
//! }
//! ```
//!
//! ## Contract flow
//!
//! 1. **Fragment**: each reconcile turns its object into a routing fragment
//! 2. **Build**: fragments are merged; not-ready resources stay out
//! 3. **Advance**: the topology store accepts only a greater generation
//! 4. **Publish**: the contract is written to the contract ConfigMap, which
//!    the data plane watches
//!
//! ## Modules
//!
//! - [`crd`] - Custom Resource Definition types with validation
//! - [`fragment`] - Conversion of resources into routing fragments
//! - [`prober`] - Background readiness probing and trust roots
//! - [`builder`] - Merging fragments into a contract
//! - [`publisher`] - Writing contracts to the contract ConfigMap
//! - [`sync`] - Build, advance and publish in one step
//! - [`consumer_group`] - Consumer groups and trigger finalizers
//! - [`controller`] - Kubernetes controllers
//! - [`resync`] - Global resync signal
//! - [`trust`] - Trust bundle reloading
//! - [`config`] - Operator configuration
//! - [`error`] - Error types

pub mod builder;
pub mod config;
pub mod consumer_group;
pub mod controller;
pub mod crd;
pub mod error;
pub mod fragment;
pub mod prober;
pub mod publisher;
pub mod resync;
pub mod sync;
pub mod trust;

pub use error::{OperatorError, Result};

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::builder::{build, BuildOutcome};
    pub use crate::config::{IngressConfig, OperatorConfig, ProberConfig};
    pub use crate::consumer_group::{
        ConsumerGroupAdmin, ConsumerGroupBinding, ConsumerGroupReconciler, InMemoryAdmin,
        KubeConsumerGroupAdmin,
    };
    pub use crate::controller::{run_controllers, watch_contract_storage, ControllerContext};
    pub use crate::crd::{KafkaBroker, KafkaChannel, KafkaConsumerGroup, KafkaSink, KafkaTrigger};
    pub use crate::error::{OperatorError, Result};
    pub use crate::fragment::{CandidateAddress, FragmentContext, RoutingFragment, RoutingSource};
    pub use crate::prober::{HttpProbeTransport, ProbeTransport, Prober, TrustRoots};
    pub use crate::publisher::{ConfigMapStorage, ContractPublisher};
    pub use crate::resync::ResyncSignal;
    pub use crate::sync::{ContractSync, SyncReport};
    pub use crate::trust::spawn_trust_bundle_watcher;
}
