//! Trust bundle reloading
//!
//! The PEM bundle used to verify TLS probes is mounted from a Secret or
//! ConfigMap. When its content changes the prober's trust roots are rotated
//! and every controller resyncs. Cached TLS results are dropped, so pending
//! resources and new or moved addresses are admitted only once they verify
//! under the new roots. Resources already routed through an unchanged
//! address stay routed.

use crate::error::{OperatorError, Result};
use crate::prober::{Prober, TrustRoots};
use crate::resync::ResyncSignal;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Load the bundle at `path`, rotate when its content differs from
/// `last`. Returns the content now in effect.
async fn reload(
    path: &Path,
    last: Option<Vec<u8>>,
    prober: &Prober,
    resync: &ResyncSignal,
) -> Option<Vec<u8>> {
    let content = match tokio::fs::read(path).await {
        Ok(content) => content,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Trust bundle unreadable, keeping current roots");
            return last;
        }
    };
    if last.as_ref() == Some(&content) {
        debug!("Trust bundle unchanged");
        return last;
    }

    match TrustRoots::from_pem(&content) {
        Ok(roots) => {
            info!(path = %path.display(), certificates = roots.len(), "Trust bundle changed");
            prober.rotate_trust_roots(roots);
            resync.trigger("trust roots rotated");
            Some(content)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Trust bundle invalid, keeping current roots");
            last
        }
    }
}

/// Watch the bundle at `path` and rotate the prober's roots on change.
///
/// `initial` is the content the prober was started with.
pub fn spawn_trust_bundle_watcher(
    path: PathBuf,
    initial: Option<Vec<u8>>,
    prober: Prober,
    resync: ResyncSignal,
) -> Result<JoinHandle<()>> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            if matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
            ) {
                let _ = tx.send(());
            }
        }
    })
    .map_err(|e| OperatorError::TrustBundleError(e.to_string()))?;

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .map_err(|e| OperatorError::TrustBundleError(e.to_string()))?;
    info!(path = %path.display(), "Watching trust bundle");

    Ok(tokio::spawn(async move {
        let _watcher = watcher;
        let mut last = initial;
        while rx.recv().await.is_some() {
            // Swallow the rest of a burst; one reload covers it.
            while rx.try_recv().is_ok() {}
            last = reload(&path, last, &prober, &resync).await;
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prober::tests::{eventually, fast_config, ScriptedTransport};
    use futures::StreamExt;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn pem(count: usize) -> Vec<u8> {
        (0..count)
            .map(|i| {
                let mut params =
                    rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
                params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
                params
                    .distinguished_name
                    .push(rcgen::DnType::CommonName, format!("ca-{}", i));
                let key = rcgen::KeyPair::generate().unwrap();
                params.self_signed(&key).unwrap().pem()
            })
            .collect::<String>()
            .into_bytes()
    }

    fn prober() -> Prober {
        Prober::new(
            fast_config(),
            Arc::new(ScriptedTransport::default()),
            TrustRoots::empty(),
        )
    }

    #[tokio::test]
    async fn test_reload_rotates_only_on_change() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ca.crt");
        let bundle = pem(1);
        std::fs::write(&path, &bundle).unwrap();

        let prober = prober();
        let resync = ResyncSignal::new();
        let mut signals = resync.stream();

        let last = reload(&path, None, &prober, &resync).await;
        assert_eq!(last.as_deref(), Some(bundle.as_slice()));
        assert_eq!(prober.trust_epoch(), 1);
        assert_eq!(signals.next().await, Some(()));

        let last = reload(&path, last, &prober, &resync).await;
        assert_eq!(prober.trust_epoch(), 1);
        assert!(last.is_some());
    }

    #[tokio::test]
    async fn test_invalid_bundle_keeps_roots() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ca.crt");
        std::fs::write(&path, b"not a certificate").unwrap();

        let prober = prober();
        let last = reload(&path, Some(b"previous".to_vec()), &prober, &ResyncSignal::new()).await;
        assert_eq!(last, Some(b"previous".to_vec()));
        assert_eq!(prober.trust_epoch(), 0);
    }

    #[tokio::test]
    async fn test_watcher_picks_up_rewrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ca.crt");
        let initial = pem(1);
        std::fs::write(&path, &initial).unwrap();

        let prober = prober();
        let handle = spawn_trust_bundle_watcher(
            path.clone(),
            Some(initial),
            prober.clone(),
            ResyncSignal::new(),
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        std::fs::write(&path, pem(2)).unwrap();

        eventually(|| prober.trust_epoch() >= 1).await;
        handle.abort();
    }
}
