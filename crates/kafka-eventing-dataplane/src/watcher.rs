//! Contract watcher
//!
//! Each data-plane replica runs one watcher per contract source. It reads the
//! serialized contract whenever the source reports a change, decodes it and
//! forwards strictly newer generations to the [`ContractBus`].
//!
//! ```text
//!        change / start
//!   Idle ──────────────▶ Reading ──▶ Applying ──▶ Idle
//!                           │
//!                           └──(unchanged, corrupt, missing)──▶ Idle
//! ```
//!
//! A corrupt payload never replaces the last good generation. Because the
//! payload is external input, the watcher waits for the next change
//! notification instead of retrying.

use crate::bus::ContractBus;
use crate::error::{DataPlaneError, Result};
use futures::stream::BoxStream;
use futures::StreamExt;
use kafka_eventing_contract::{Contract, ContractSource};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Phase of the watch loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherPhase {
    Idle,
    Reading,
    Applying,
}

impl WatcherPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => WatcherPhase::Reading,
            2 => WatcherPhase::Applying,
            _ => WatcherPhase::Idle,
        }
    }
}

/// Result of handling one storage payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A newer generation was forwarded to the bus
    Applied(u64),
    /// The generation was not newer than the last seen one
    Unchanged(u64),
    /// The payload could not be decoded; previous state retained
    Rejected,
    /// The watcher is closed; nothing was forwarded
    Closed,
}

/// Watches a contract source and feeds the local bus
pub struct ContractWatcher<S: ContractSource> {
    inner: Arc<WatcherInner<S>>,
    started: AtomicBool,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct WatcherInner<S> {
    source: S,
    bus: Arc<ContractBus>,
    last_generation: Mutex<Option<u64>>,
    phase: AtomicU8,
    closed: AtomicBool,
}

impl<S: ContractSource> ContractWatcher<S> {
    /// Create a watcher; nothing happens until [`start`](Self::start)
    pub fn new(source: S, bus: Arc<ContractBus>) -> Self {
        Self {
            inner: Arc::new(WatcherInner {
                source,
                bus,
                last_generation: Mutex::new(None),
                phase: AtomicU8::new(WatcherPhase::Idle as u8),
                closed: AtomicBool::new(false),
            }),
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Start the watch loop.
    ///
    /// Performs one read-and-apply pass immediately, then re-reads on every
    /// change notification. Fails with [`DataPlaneError::AlreadyStarted`] on
    /// any call after the first, and with [`DataPlaneError::Closed`] after
    /// `close`.
    pub fn start(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(DataPlaneError::Closed);
        }
        if self.started.load(Ordering::SeqCst) {
            return Err(DataPlaneError::AlreadyStarted);
        }

        // Subscribe before the initial read so a write landing in between
        // still produces a notification. A failed subscription leaves the
        // watcher unstarted so the caller can try again.
        let changes = self.inner.source.changes()?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(DataPlaneError::AlreadyStarted);
        }
        let inner = Arc::clone(&self.inner);
        let cancel = self.cancel.clone();

        let handle = tokio::spawn(async move { inner.run(changes, cancel).await });
        *self.task.lock() = Some(handle);

        info!(address = %self.inner.bus.address(), "Contract watcher started");
        Ok(())
    }

    /// Handle a raw storage payload directly.
    pub fn on_storage_change(&self, raw: &[u8]) -> ApplyOutcome {
        self.inner.apply(raw)
    }

    /// Stop the watch loop.
    ///
    /// Cancels an in-flight read and waits for the loop to exit, so no bus
    /// delivery happens after this returns. Idempotent: returns `false` when
    /// the watcher was already closed.
    pub async fn close(&self) -> bool {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        // Wait out an apply that got past the closed check before the swap.
        drop(self.inner.last_generation.lock());
        self.cancel.cancel();

        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Contract watch loop ended abnormally");
            }
        }

        info!(address = %self.inner.bus.address(), "Contract watcher closed");
        true
    }

    /// Last generation forwarded to the bus
    pub fn last_generation(&self) -> Option<u64> {
        *self.inner.last_generation.lock()
    }

    /// Current phase of the watch loop
    pub fn phase(&self) -> WatcherPhase {
        WatcherPhase::from_u8(self.inner.phase.load(Ordering::SeqCst))
    }

    /// Whether `start` has been called
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

impl<S: ContractSource> WatcherInner<S> {
    async fn run(self: Arc<Self>, mut changes: BoxStream<'static, ()>, cancel: CancellationToken) {
        self.sync(&cancel).await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = changes.next() => match next {
                    Some(()) => self.sync(&cancel).await,
                    None => {
                        warn!("Contract change stream ended");
                        break;
                    }
                },
            }
        }

        self.set_phase(WatcherPhase::Idle);
        debug!("Contract watch loop exited");
    }

    #[instrument(skip_all)]
    async fn sync(&self, cancel: &CancellationToken) {
        self.set_phase(WatcherPhase::Reading);

        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.set_phase(WatcherPhase::Idle);
                return;
            }
            read = self.source.read() => read,
        };

        match read {
            Ok(Some(raw)) => {
                self.apply(&raw);
            }
            Ok(None) => debug!("No contract in storage yet"),
            Err(e) => warn!(error = %e, "Failed to read contract, waiting for next change"),
        }

        self.set_phase(WatcherPhase::Idle);
    }

    fn apply(&self, raw: &[u8]) -> ApplyOutcome {
        if self.closed.load(Ordering::SeqCst) {
            return ApplyOutcome::Closed;
        }

        let contract = match Contract::from_bytes(raw) {
            Ok(contract) => contract,
            Err(e) => {
                warn!(error = %e, "Failed to decode contract, keeping previous state");
                return ApplyOutcome::Rejected;
            }
        };

        // Held across the bus publish so two concurrent payloads cannot
        // reach the bus out of order. Publishing only enqueues.
        let mut last = self.last_generation.lock();
        if self.closed.load(Ordering::SeqCst) {
            return ApplyOutcome::Closed;
        }
        if let Some(previous) = *last {
            if contract.generation <= previous {
                debug!(
                    generation = contract.generation,
                    last_generation = previous,
                    "Contract unchanged"
                );
                return ApplyOutcome::Unchanged(contract.generation);
            }
        }

        let generation = contract.generation;
        let phase = self.phase.swap(WatcherPhase::Applying as u8, Ordering::SeqCst);
        *last = Some(generation);
        self.bus.publish_local(contract);
        self.phase.store(phase, Ordering::SeqCst);

        info!(generation, "Contract applied");
        ApplyOutcome::Applied(generation)
    }

    fn set_phase(&self, phase: WatcherPhase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }
}
