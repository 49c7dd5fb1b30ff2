//! Contract publisher
//!
//! Serializes contracts into the shared storage entry. The write itself is
//! the change signal for every data-plane watcher. A failed write is returned
//! to the caller's reconcile loop; the publisher never retries on its own.

use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kafka_eventing_contract::{Contract, ContractError, ContractStorage};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

/// ConfigMap key holding the serialized contract
pub const CONTRACT_KEY: &str = "data";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "kafka-eventing-operator";

/// Contract storage backed by a ConfigMap's `binaryData`
#[derive(Clone)]
pub struct ConfigMapStorage {
    api: Api<ConfigMap>,
    namespace: String,
    name: String,
}

impl ConfigMapStorage {
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn config_map(&self, payload: Option<Vec<u8>>) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(BTreeMap::from([(
                    "app.kubernetes.io/managed-by".to_string(),
                    FIELD_MANAGER.to_string(),
                )])),
                ..Default::default()
            },
            binary_data: payload
                .map(|payload| BTreeMap::from([(CONTRACT_KEY.to_string(), ByteString(payload))])),
            ..Default::default()
        }
    }
}

fn payload_of(config_map: ConfigMap) -> Option<Vec<u8>> {
    config_map
        .binary_data
        .and_then(|mut data| data.remove(CONTRACT_KEY))
        .map(|bytes| bytes.0)
}

fn storage_error(e: kube::Error) -> ContractError {
    ContractError::Storage(e.to_string())
}

#[async_trait]
impl ContractStorage for ConfigMapStorage {
    async fn get_or_create(&self) -> kafka_eventing_contract::Result<Option<Vec<u8>>> {
        if let Some(existing) = self.api.get_opt(&self.name).await.map_err(storage_error)? {
            return Ok(payload_of(existing));
        }

        info!(
            namespace = %self.namespace,
            name = %self.name,
            "Contract ConfigMap not found, creating"
        );
        match self
            .api
            .create(&PostParams::default(), &self.config_map(None))
            .await
        {
            Ok(_) => Ok(None),
            // Lost a creation race; read whatever won.
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                let existing = self.api.get(&self.name).await.map_err(storage_error)?;
                Ok(payload_of(existing))
            }
            Err(e) => Err(storage_error(e)),
        }
    }

    async fn write(&self, payload: Vec<u8>) -> kafka_eventing_contract::Result<()> {
        let params = PatchParams::apply(FIELD_MANAGER).force();
        self.api
            .patch(&self.name, &params, &Patch::Apply(&self.config_map(Some(payload))))
            .await
            .map_err(storage_error)?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct PublisherState {
    last_published: Option<u64>,
    closed: bool,
}

/// Writes contracts to shared storage in generation order
pub struct ContractPublisher<S: ContractStorage> {
    storage: S,
    state: Mutex<PublisherState>,
}

impl<S: ContractStorage> ContractPublisher<S> {
    /// Create a publisher that has not published anything yet
    pub fn new(storage: S) -> Self {
        Self::resume(storage, None)
    }

    /// Create a publisher that continues after `last_published`
    pub fn resume(storage: S, last_published: Option<u64>) -> Self {
        Self {
            storage,
            state: Mutex::new(PublisherState {
                last_published,
                closed: false,
            }),
        }
    }

    /// Shared storage behind the publisher
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Serialize `contract` and write it.
    ///
    /// Returns `Ok(false)` without writing when the generation was already
    /// published. Storage failures are returned as is.
    #[instrument(skip_all, fields(generation = contract.generation))]
    pub async fn publish(&self, contract: &Contract) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(OperatorError::Closed("contract publisher".to_string()));
        }
        if state
            .last_published
            .is_some_and(|last| contract.generation <= last)
        {
            debug!("Generation already published");
            return Ok(false);
        }

        let payload = contract.to_bytes()?;
        self.storage.write(payload).await?;
        state.last_published = Some(contract.generation);

        info!(
            resources = contract.resources.len(),
            egresses = contract.egress_count(),
            "Contract published"
        );
        Ok(true)
    }

    /// Publish the drain contract at `generation` and stop publishing.
    ///
    /// The drain is raised above the last published generation when needed.
    /// Idempotent: returns `Ok(None)` when already closed, otherwise the
    /// generation written. If the drain write fails the publisher stays open
    /// so the caller can retry.
    pub async fn close(&self, generation: u64) -> Result<Option<u64>> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(None);
        }

        let generation = state
            .last_published
            .map_or(generation, |last| generation.max(last + 1));
        let drain = Contract::drain(generation);
        self.storage.write(drain.to_bytes()?).await?;
        state.last_published = Some(generation);
        state.closed = true;

        info!(generation, "Drain contract published, publisher closed");
        Ok(Some(generation))
    }

    /// Generation of the last successful write
    pub async fn last_published(&self) -> Option<u64> {
        self.state.lock().await.last_published
    }

    /// Forget the last published generation, e.g. after the storage entry
    /// was deleted, so the next publish rewrites the current contract
    pub async fn reset(&self) {
        self.state.lock().await.last_published = None;
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }
}
