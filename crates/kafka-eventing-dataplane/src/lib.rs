//! # Kafka eventing data plane
//!
//! Data-plane half of contract synchronization. Every replica watches the
//! shared contract entry, decodes it, and fans strictly newer generations out
//! to the in-process components over a [`ContractBus`].
//!
//! ```rust,ignore
//! use kafka_eventing_dataplane::prelude::*;
//! use std::sync::Arc;
//!
//! let bus = Arc::new(ContractBus::default());
//! let receiver = Arc::new(Receiver::new());
//! spawn_receiver(Arc::clone(&receiver), bus.subscribe());
//!
//! let watcher = ContractWatcher::new(FileSource::new("/etc/contract/data"), Arc::clone(&bus));
//! watcher.start()?;
//! // ...
//! watcher.close().await;
//! bus.close();
//! ```
//!
//! ## Modules
//!
//! - [`bus`] - process-local publish/subscribe for contracts
//! - [`watcher`] - storage watcher feeding the bus
//! - [`source`] - file-backed contract source
//! - [`components`] - receiver and dispatcher bus consumers

pub mod bus;
pub mod components;
pub mod error;
pub mod source;
pub mod watcher;

pub use bus::{ContractBus, Subscription, CONTRACT_ADDRESS};
pub use components::{spawn_dispatcher, spawn_receiver, Dispatcher, Receiver, RouteDiff};
pub use error::{DataPlaneError, Result};
pub use source::FileSource;
pub use watcher::{ApplyOutcome, ContractWatcher, WatcherPhase};

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::bus::{ContractBus, Subscription};
    pub use crate::components::{spawn_dispatcher, spawn_receiver, Dispatcher, Receiver};
    pub use crate::error::{DataPlaneError, Result};
    pub use crate::source::FileSource;
    pub use crate::watcher::ContractWatcher;
}
