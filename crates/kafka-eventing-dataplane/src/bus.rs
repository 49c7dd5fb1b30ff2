//! Local fan-out bus
//!
//! Delivers each freshly decoded [`Contract`] to every in-process component
//! (receivers, dispatchers) that subscribed on the bus address.
//!
//! Every subscriber owns an unbounded queue, so publishing never waits on a
//! slow subscriber. Publishing is serialized under a short lock that does no
//! I/O; it only enqueues, which keeps per-subscriber order equal to
//! generation order. A generation that is not strictly greater than the last
//! published one is dropped, so no subscriber can observe a regression.

use futures::Stream;
use kafka_eventing_contract::Contract;
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Default process-local bus address for contract updates
pub const CONTRACT_ADDRESS: &str = "contract.updates";

/// Process-local publish/subscribe channel for contracts
#[derive(Debug)]
pub struct ContractBus {
    address: String,
    state: Mutex<BusState>,
}

#[derive(Debug, Default)]
struct BusState {
    last_generation: Option<u64>,
    subscribers: Vec<mpsc::UnboundedSender<Arc<Contract>>>,
    closed: bool,
}

impl Default for ContractBus {
    fn default() -> Self {
        Self::new(CONTRACT_ADDRESS)
    }
}

impl ContractBus {
    /// Create a bus bound to the given address
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            state: Mutex::new(BusState::default()),
        }
    }

    /// Bus address
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Register a new subscriber. It receives only generations published
    /// after this call. Subscribing to a closed bus yields a subscription
    /// that ends immediately.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        if !state.closed {
            state.subscribers.push(tx);
        }
        Subscription { rx }
    }

    /// Publish a contract to all current subscribers.
    ///
    /// Returns `false` when the contract was dropped: the bus is closed or
    /// the generation does not advance past the last published one.
    pub fn publish_local(&self, contract: Contract) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            debug!(address = %self.address, "Bus closed, dropping contract");
            return false;
        }
        if let Some(last) = state.last_generation {
            if contract.generation <= last {
                debug!(
                    address = %self.address,
                    generation = contract.generation,
                    last_generation = last,
                    "Dropping non-advancing contract"
                );
                return false;
            }
        }

        state.last_generation = Some(contract.generation);
        let contract = Arc::new(contract);
        // Subscribers whose receiver is gone are pruned on the way.
        state
            .subscribers
            .retain(|tx| tx.send(Arc::clone(&contract)).is_ok());

        debug!(
            address = %self.address,
            generation = contract.generation,
            subscribers = state.subscribers.len(),
            "Contract published"
        );
        true
    }

    /// Publish the drain contract and tear the bus down.
    ///
    /// Every subscriber receives a final contract with zero routing entries,
    /// then its stream ends. Idempotent: returns `false` if already closed.
    pub fn close(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }

        let generation = state.last_generation.map_or(0, |g| g + 1);
        let drain = Arc::new(Contract::drain(generation));
        for tx in &state.subscribers {
            let _ = tx.send(Arc::clone(&drain));
        }
        state.last_generation = Some(generation);
        state.subscribers.clear();
        state.closed = true;

        info!(address = %self.address, generation, "Bus drained and closed");
        true
    }

    /// Generation of the last published contract
    pub fn last_generation(&self) -> Option<u64> {
        self.state.lock().last_generation
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// A component's registration on the bus
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Arc<Contract>>,
}

impl Subscription {
    /// Wait for the next contract; `None` once the bus is closed and drained
    pub async fn recv(&mut self) -> Option<Arc<Contract>> {
        self.rx.recv().await
    }

    /// Take the next contract if one is already queued
    pub fn try_recv(&mut self) -> Option<Arc<Contract>> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = Arc<Contract>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
