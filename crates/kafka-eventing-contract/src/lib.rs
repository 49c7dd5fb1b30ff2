//! # Kafka Eventing Contract
//!
//! Shared data model for the routing topology that the control plane
//! derives from cluster resources and every data-plane replica applies.
//!
//! The topology is a single generation-stamped snapshot, the [`Contract`].
//! The control plane owns the only writer path; replicas converge by
//! reading the serialized snapshot from shared storage and discarding any
//! generation they have already applied.
//!
//! ## Modules
//!
//! - [`contract`] - Contract types and the JSON wire codec
//! - [`store`] - In-process topology store with compare-and-replace on generation
//! - [`storage`] - Shared storage seams used by publishers and watchers
//! - [`error`] - Error types
//!
//! ## Example
//!
//! ```rust
//! use kafka_eventing_contract::{Contract, TopologyStore};
//!
//! let store = TopologyStore::new();
//! let next = Contract::new(1, vec![]);
//!
//! assert!(store.try_advance(next.clone()));
//! // Replaying the same generation is harmless.
//! assert!(!store.try_advance(next));
//! assert_eq!(store.generation(), 1);
//! ```

pub mod contract;
pub mod error;
pub mod storage;
pub mod store;

pub use contract::{
    BackoffPolicy, Contract, DeliveryOrder, Egress, EgressConfig, Ingress, Reference, Resource,
};
pub use error::{ContractError, Result};
pub use storage::{ContractSource, ContractStorage, MemoryStorage};
pub use store::TopologyStore;
