//! Global resync signal
//!
//! Some events change the outcome of every reconcile at once: an address
//! becoming ready, rotated trust roots, the contract ConfigMap disappearing.
//! Each controller turns this signal into a full requeue of its objects.

use futures::stream::{self, Stream};
use std::pin::Pin;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

const CAPACITY: usize = 16;

/// Resync stream handed to `Controller::reconcile_all_on`, which needs it
/// to be `Sync` as well as `Send`
pub type ResyncStream = Pin<Box<dyn Stream<Item = ()> + Send + Sync + 'static>>;

/// Broadcast handle fanning a resync out to every controller
#[derive(Debug, Clone)]
pub struct ResyncSignal {
    tx: broadcast::Sender<()>,
}

impl Default for ResyncSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ResyncSignal {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CAPACITY);
        Self { tx }
    }

    /// Request a resync of everything
    pub fn trigger(&self, reason: &str) {
        debug!(reason, "Global resync requested");
        let _ = self.tx.send(());
    }

    /// Stream yielding once per requested resync. Signals missed while the
    /// consumer lagged collapse into one.
    pub fn stream(&self) -> ResyncStream {
        Box::pin(stream::unfold(self.tx.subscribe(), |mut rx| async move {
            match rx.recv().await {
                Ok(()) | Err(RecvError::Lagged(_)) => Some(((), rx)),
                Err(RecvError::Closed) => None,
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    fn assert_send_sync<T: Send + Sync + 'static>(_: &T) {}

    #[test]
    fn test_stream_is_send_and_sync() {
        let signal = ResyncSignal::new();
        assert_send_sync(&signal.stream());
    }

    #[tokio::test]
    async fn test_every_stream_sees_trigger() {
        let signal = ResyncSignal::new();
        let mut a = signal.stream();
        let mut b = signal.stream();

        signal.trigger("test");
        for stream in [&mut a, &mut b] {
            let next = tokio::time::timeout(Duration::from_secs(1), stream.next())
                .await
                .unwrap();
            assert_eq!(next, Some(()));
        }
    }

    #[tokio::test]
    async fn test_lagged_stream_keeps_going() {
        let signal = ResyncSignal::new();
        let mut stream = signal.stream();
        for _ in 0..CAPACITY * 2 {
            signal.trigger("burst");
        }

        assert_eq!(stream.next().await, Some(()));
        assert_eq!(stream.next().await, Some(()));
    }

    #[tokio::test]
    async fn test_stream_ends_when_signal_dropped() {
        let signal = ResyncSignal::new();
        let mut stream = signal.stream();
        drop(signal);
        assert_eq!(stream.next().await, None);
    }
}
