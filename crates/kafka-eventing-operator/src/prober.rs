//! Readiness prober
//!
//! A resource is only admitted into the contract once its receiver answers
//! on the candidate address. `is_ready` never waits for the network: it
//! answers from the cache and starts a background probe loop when the entry
//! is missing or stale.
//!
//! Each cache entry is owned by at most one probe loop, identified by a
//! token. Rotating the trust roots replaces every TLS entry (and its token)
//! under the write lock, so a loop that was probing with the old roots finds
//! its token gone and drops its result, and readers never see a "ready"
//! obtained under retired roots.

use crate::config::ProberConfig;
use crate::error::{OperatorError, Result};
use crate::fragment::CandidateAddress;
use async_trait::async_trait;
use parking_lot::RwLock;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::{BufReader, Cursor};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Cached readiness of an address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    Ready,
    NotReady,
    /// Never probed, or invalidated by a trust-root rotation
    Unknown,
}

/// Certificate authorities used to validate TLS candidate addresses
#[derive(Clone)]
pub struct TrustRoots {
    store: Arc<RootCertStore>,
}

impl TrustRoots {
    /// No trust roots; every TLS probe fails
    pub fn empty() -> Self {
        Self {
            store: Arc::new(RootCertStore::empty()),
        }
    }

    /// Build from DER certificates
    pub fn from_certs(certs: Vec<CertificateDer<'static>>) -> Result<Self> {
        let mut store = RootCertStore::empty();
        for cert in certs {
            store.add(cert).map_err(|e| {
                OperatorError::TrustBundleError(format!("Failed to add root CA: {}", e))
            })?;
        }
        Ok(Self {
            store: Arc::new(store),
        })
    }

    /// Parse a PEM bundle
    pub fn from_pem(data: &[u8]) -> Result<Self> {
        let mut reader = BufReader::new(Cursor::new(data));
        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| OperatorError::TrustBundleError(format!("Failed to parse PEM: {}", e)))?;

        if certs.is_empty() {
            return Err(OperatorError::TrustBundleError(
                "No certificates found in PEM data".to_string(),
            ));
        }
        Self::from_certs(certs)
    }

    /// Read a PEM bundle from disk
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| {
            OperatorError::TrustBundleError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_pem(&data)
    }

    /// Number of trusted certificates
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Underlying rustls store
    pub fn store(&self) -> Arc<RootCertStore> {
        Arc::clone(&self.store)
    }
}

impl fmt::Debug for TrustRoots {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustRoots")
            .field("certificates", &self.store.len())
            .finish()
    }
}

/// Performs one readiness check against an address
#[async_trait]
pub trait ProbeTransport: Send + Sync + 'static {
    /// `true` iff the receiver answered successfully; TLS addresses are
    /// validated against `roots`
    async fn probe(&self, address: &CandidateAddress, roots: &TrustRoots) -> bool;
}

/// Issues `GET <path>` over plain TCP or rustls and expects `200`
#[derive(Debug, Clone, Default)]
pub struct HttpProbeTransport;

impl HttpProbeTransport {
    async fn try_probe(
        &self,
        address: &CandidateAddress,
        roots: &TrustRoots,
    ) -> std::io::Result<bool> {
        let tcp = TcpStream::connect((address.host.as_str(), address.port)).await?;

        if !address.tls {
            return request(tcp, address).await;
        }

        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(std::io::Error::other)?
        .with_root_certificates(roots.store())
        .with_no_client_auth();

        let server_name = ServerName::try_from(address.host.clone()).map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Invalid server name: {}", address.host),
            )
        })?;

        let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
        let tls = connector.connect(server_name, tcp).await?;
        request(tls, address).await
    }
}

#[async_trait]
impl ProbeTransport for HttpProbeTransport {
    async fn probe(&self, address: &CandidateAddress, roots: &TrustRoots) -> bool {
        match self.try_probe(address, roots).await {
            Ok(ready) => ready,
            Err(e) => {
                debug!(address = %address, error = %e, "Probe failed");
                false
            }
        }
    }
}

async fn request<S>(mut stream: S, address: &CandidateAddress) -> std::io::Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: kafka-eventing-prober\r\nConnection: close\r\n\r\n",
        address.path, address.host
    );
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut response = Vec::with_capacity(128);
    let mut buf = [0u8; 256];
    while !response.windows(2).any(|w| w == b"\r\n") && response.len() < 1024 {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        response.extend_from_slice(&buf[..n]);
    }

    let status_line = String::from_utf8_lossy(&response);
    Ok(status_line.split_whitespace().nth(1) == Some("200"))
}

type ReadyCallback = Arc<dyn Fn(&CandidateAddress) + Send + Sync>;

/// Non-blocking readiness cache with background probing
#[derive(Clone)]
pub struct Prober {
    inner: Arc<ProberInner>,
}

struct ProberInner {
    config: ProberConfig,
    transport: Arc<dyn ProbeTransport>,
    state: RwLock<ProberState>,
    on_ready: RwLock<Option<ReadyCallback>>,
}

struct ProberState {
    roots: TrustRoots,
    epoch: u64,
    next_token: u64,
    entries: HashMap<CandidateAddress, Entry>,
}

#[derive(Debug, Clone)]
struct Entry {
    status: ProbeStatus,
    checked_at: Option<Instant>,
    failures: u32,
    /// Token of the loop owning this entry, if one is running
    active: Option<u64>,
}

impl Entry {
    fn unknown() -> Self {
        Self {
            status: ProbeStatus::Unknown,
            checked_at: None,
            failures: 0,
            active: None,
        }
    }
}

impl ProberState {
    fn claim(&mut self, address: &CandidateAddress) -> u64 {
        self.next_token += 1;
        let token = self.next_token;
        self.entries
            .entry(address.clone())
            .or_insert_with(Entry::unknown)
            .active = Some(token);
        token
    }
}

impl Prober {
    /// Create a prober with the given transport and initial trust roots
    pub fn new(
        config: ProberConfig,
        transport: Arc<dyn ProbeTransport>,
        roots: TrustRoots,
    ) -> Self {
        Self {
            inner: Arc::new(ProberInner {
                config,
                transport,
                state: RwLock::new(ProberState {
                    roots,
                    epoch: 0,
                    next_token: 0,
                    entries: HashMap::new(),
                }),
                on_ready: RwLock::new(None),
            }),
        }
    }

    /// Register a callback invoked whenever an address becomes ready
    pub fn on_ready<F>(&self, callback: F)
    where
        F: Fn(&CandidateAddress) + Send + Sync + 'static,
    {
        *self.inner.on_ready.write() = Some(Arc::new(callback));
    }

    /// Cached readiness of `address`.
    ///
    /// Starts a background probe when the address is unknown or its ready
    /// result is older than the refresh interval. Never blocks on I/O.
    pub fn is_ready(&self, address: &CandidateAddress) -> bool {
        {
            let state = self.inner.state.read();
            if let Some(entry) = state.entries.get(address) {
                if entry.active.is_some() || !self.needs_probe(entry) {
                    return entry.status == ProbeStatus::Ready;
                }
            }
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return self.status(address) == ProbeStatus::Ready;
        };

        let (ready, token) = {
            let mut state = self.inner.state.write();
            let entry = state
                .entries
                .entry(address.clone())
                .or_insert_with(Entry::unknown);
            let ready = entry.status == ProbeStatus::Ready;
            // Re-checked under the write lock; another reader may have won.
            if entry.active.is_some() || !self.needs_probe(entry) {
                return ready;
            }
            (ready, state.claim(address))
        };

        handle.spawn(probe_loop(
            Arc::clone(&self.inner),
            address.clone(),
            token,
        ));
        ready
    }

    fn needs_probe(&self, entry: &Entry) -> bool {
        match entry.status {
            ProbeStatus::Ready => entry
                .checked_at
                .map_or(true, |at| at.elapsed() >= self.inner.config.refresh_interval),
            ProbeStatus::NotReady | ProbeStatus::Unknown => true,
        }
    }

    /// Replace the trust roots.
    ///
    /// Every cached TLS result is invalidated atomically and re-probed under
    /// the new roots. Plain entries keep their results and their loops.
    pub fn rotate_trust_roots(&self, roots: TrustRoots) {
        let (epoch, reprobe) = {
            let mut state = self.inner.state.write();
            state.roots = roots;
            state.epoch += 1;

            let tls: Vec<CandidateAddress> = state
                .entries
                .keys()
                .filter(|address| address.tls)
                .cloned()
                .collect();
            let mut reprobe = Vec::with_capacity(tls.len());
            for address in tls {
                state.entries.insert(address.clone(), Entry::unknown());
                let token = state.claim(&address);
                reprobe.push((address, token));
            }
            (state.epoch, reprobe)
        };

        info!(
            epoch,
            invalidated = reprobe.len(),
            "Trust roots rotated, re-probing TLS addresses"
        );

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                for (address, token) in reprobe {
                    handle.spawn(probe_loop(Arc::clone(&self.inner), address, token));
                }
            }
            Err(_) => {
                // Without a runtime the entries stay unclaimed so the next
                // is_ready call inside one starts their loops.
                let mut state = self.inner.state.write();
                for (address, _) in reprobe {
                    if let Some(entry) = state.entries.get_mut(&address) {
                        entry.active = None;
                    }
                }
            }
        }
    }

    /// Cached status without scheduling anything
    pub fn status(&self, address: &CandidateAddress) -> ProbeStatus {
        self.inner
            .state
            .read()
            .entries
            .get(address)
            .map_or(ProbeStatus::Unknown, |entry| entry.status)
    }

    /// Consecutive failed probes of `address`
    pub fn failures(&self, address: &CandidateAddress) -> u32 {
        self.inner
            .state
            .read()
            .entries
            .get(address)
            .map_or(0, |entry| entry.failures)
    }

    /// Drop every entry whose address is not in `referenced`; their probe
    /// loops stop at their next step
    pub fn retain(&self, referenced: &HashSet<CandidateAddress>) -> usize {
        let mut state = self.inner.state.write();
        let before = state.entries.len();
        state.entries.retain(|address, _| referenced.contains(address));
        let removed = before - state.entries.len();
        if removed > 0 {
            debug!(removed, "Dropped unreferenced probe entries");
        }
        removed
    }

    /// Number of tracked addresses
    pub fn tracked(&self) -> usize {
        self.inner.state.read().entries.len()
    }

    /// Number of trust-root rotations applied
    pub fn trust_epoch(&self) -> u64 {
        self.inner.state.read().epoch
    }

    /// Prober timings
    pub fn config(&self) -> &ProberConfig {
        &self.inner.config
    }
}

impl fmt::Debug for Prober {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("Prober")
            .field("epoch", &state.epoch)
            .field("tracked", &state.entries.len())
            .finish()
    }
}

async fn probe_once(inner: &ProberInner, address: &CandidateAddress, roots: &TrustRoots) -> bool {
    tokio::time::timeout(inner.config.timeout, inner.transport.probe(address, roots))
        .await
        .unwrap_or(false)
}

/// Probe until ready, backing off between failures. Exits as soon as the
/// entry is removed or claimed by another loop.
async fn probe_loop(inner: Arc<ProberInner>, address: CandidateAddress, token: u64) {
    loop {
        let roots = {
            let state = inner.state.read();
            match state.entries.get(&address) {
                Some(entry) if entry.active == Some(token) => state.roots.clone(),
                _ => return,
            }
        };

        let ready = probe_once(&inner, &address, &roots).await;

        let (delay, became_ready) = {
            let mut state = inner.state.write();
            let Some(entry) = state.entries.get_mut(&address) else {
                return;
            };
            if entry.active != Some(token) {
                debug!(address = %address, "Discarding superseded probe result");
                return;
            }

            entry.checked_at = Some(Instant::now());
            if ready {
                let became_ready = entry.status != ProbeStatus::Ready;
                entry.status = ProbeStatus::Ready;
                entry.failures = 0;
                entry.active = None;
                (None, became_ready)
            } else {
                entry.status = ProbeStatus::NotReady;
                entry.failures = entry.failures.saturating_add(1);
                if entry.failures == inner.config.warn_after_attempts {
                    warn!(
                        address = %address,
                        attempts = entry.failures,
                        "Address still not ready, continuing to retry"
                    );
                }
                (Some(inner.config.backoff(entry.failures)), false)
            }
        };

        if became_ready {
            debug!(address = %address, "Address became ready");
            let callback = inner.on_ready.read().clone();
            if let Some(callback) = callback {
                callback(&address);
            }
        }

        match delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => return,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Transport answering from a table; TLS addresses additionally require
    /// exactly `accepted_roots` trust roots
    #[derive(Default)]
    pub(crate) struct ScriptedTransport {
        pub ready: parking_lot::Mutex<HashSet<CandidateAddress>>,
        pub accepted_roots: AtomicUsize,
        pub calls: AtomicUsize,
        pub hold_first: AtomicBool,
        pub release: Notify,
    }

    impl ScriptedTransport {
        pub fn set_ready(&self, address: &CandidateAddress, ready: bool) {
            let mut table = self.ready.lock();
            if ready {
                table.insert(address.clone());
            } else {
                table.remove(address);
            }
        }
    }

    #[async_trait]
    impl ProbeTransport for ScriptedTransport {
        async fn probe(&self, address: &CandidateAddress, roots: &TrustRoots) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hold_first.swap(false, Ordering::SeqCst) {
                self.release.notified().await;
            }
            let listed = self.ready.lock().contains(address);
            listed && (!address.tls || roots.len() == self.accepted_roots.load(Ordering::SeqCst))
        }
    }

    pub(crate) fn fast_config() -> ProberConfig {
        ProberConfig {
            timeout: Duration::from_secs(1),
            refresh_interval: Duration::from_secs(3600),
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_millis(20),
            warn_after_attempts: 3,
        }
    }

    pub(crate) async fn eventually<F: Fn() -> bool>(check: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn ca(name: &str) -> (rcgen::Certificate, rcgen::KeyPair) {
        let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, name);
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        (cert, key)
    }

    fn roots(count: usize) -> TrustRoots {
        TrustRoots::from_certs(
            (0..count)
                .map(|i| ca(&format!("ca-{}", i)).0.der().clone())
                .collect(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_unknown_address_probed_in_background() {
        let transport = Arc::new(ScriptedTransport::default());
        let address = CandidateAddress::plain("ingress", 80, "/ns/a");
        transport.set_ready(&address, true);

        let prober = Prober::new(fast_config(), transport.clone(), TrustRoots::empty());
        assert!(!prober.is_ready(&address));

        eventually(|| prober.is_ready(&address)).await;
        assert_eq!(prober.status(&address), ProbeStatus::Ready);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_not_ready_retried_with_backoff() {
        let transport = Arc::new(ScriptedTransport::default());
        let address = CandidateAddress::plain("ingress", 80, "/ns/a");
        let prober = Prober::new(fast_config(), transport.clone(), TrustRoots::empty());

        assert!(!prober.is_ready(&address));
        eventually(|| prober.failures(&address) >= 3).await;
        assert_eq!(prober.status(&address), ProbeStatus::NotReady);

        transport.set_ready(&address, true);
        eventually(|| prober.is_ready(&address)).await;
        assert_eq!(prober.failures(&address), 0);
    }

    #[tokio::test]
    async fn test_on_ready_callback_fires_on_transition() {
        let transport = Arc::new(ScriptedTransport::default());
        let address = CandidateAddress::plain("ingress", 80, "/ns/a");
        transport.set_ready(&address, true);

        let prober = Prober::new(fast_config(), transport, TrustRoots::empty());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        prober.on_ready(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        prober.is_ready(&address);
        eventually(|| fired.load(Ordering::SeqCst) == 1).await;
        assert!(prober.is_ready(&address));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rotation_invalidates_tls_results_only() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.accepted_roots.store(1, Ordering::SeqCst);
        let plain = CandidateAddress::plain("ingress", 80, "/ns/a");
        let tls = CandidateAddress::tls("ingress", 443, "/ns/a");
        transport.set_ready(&plain, true);
        transport.set_ready(&tls, true);

        let prober = Prober::new(fast_config(), transport.clone(), roots(1));
        prober.is_ready(&plain);
        prober.is_ready(&tls);
        eventually(|| prober.is_ready(&plain) && prober.is_ready(&tls)).await;

        prober.rotate_trust_roots(roots(2));

        // Visible immediately, before any re-probe completes.
        assert!(!prober.is_ready(&tls));
        assert!(prober.is_ready(&plain));
        assert_eq!(prober.trust_epoch(), 1);

        eventually(|| prober.status(&tls) == ProbeStatus::NotReady).await;
        assert!(prober.is_ready(&plain));

        transport.accepted_roots.store(2, Ordering::SeqCst);
        eventually(|| prober.is_ready(&tls)).await;
    }

    #[tokio::test]
    async fn test_in_flight_probe_across_rotation_is_discarded() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.accepted_roots.store(1, Ordering::SeqCst);
        transport.hold_first.store(true, Ordering::SeqCst);
        let tls = CandidateAddress::tls("ingress", 443, "/ns/a");
        transport.set_ready(&tls, true);

        let prober = Prober::new(fast_config(), transport.clone(), roots(1));
        assert!(!prober.is_ready(&tls));
        eventually(|| transport.calls.load(Ordering::SeqCst) == 1).await;

        // The held probe uses the old roots and would succeed.
        prober.rotate_trust_roots(roots(2));
        transport.release.notify_one();

        eventually(|| prober.failures(&tls) >= 2).await;
        assert_eq!(prober.status(&tls), ProbeStatus::NotReady);
        assert!(!prober.is_ready(&tls));
    }

    #[tokio::test]
    async fn test_retain_drops_unreferenced_entries() {
        let transport = Arc::new(ScriptedTransport::default());
        let a = CandidateAddress::plain("ingress", 80, "/ns/a");
        let b = CandidateAddress::plain("ingress", 80, "/ns/b");
        transport.set_ready(&a, true);

        let prober = Prober::new(fast_config(), transport.clone(), TrustRoots::empty());
        prober.is_ready(&a);
        prober.is_ready(&b);
        assert_eq!(prober.tracked(), 2);

        let referenced: HashSet<_> = [a.clone()].into_iter().collect();
        assert_eq!(prober.retain(&referenced), 1);
        assert_eq!(prober.tracked(), 1);
        assert_eq!(prober.status(&b), ProbeStatus::Unknown);

        // The loop for b stops instead of recreating its entry.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(prober.tracked(), 1);
    }

    #[test]
    fn test_is_ready_without_runtime_does_not_panic() {
        let prober = Prober::new(
            fast_config(),
            Arc::new(ScriptedTransport::default()),
            TrustRoots::empty(),
        );
        let address = CandidateAddress::plain("ingress", 80, "/ns/a");
        assert!(!prober.is_ready(&address));
        prober.rotate_trust_roots(TrustRoots::empty());
    }

    #[test]
    fn test_trust_roots_from_pem() {
        let (cert, _) = ca("bundle");
        let bundle = format!("{}{}", cert.pem(), ca("second").0.pem());
        let roots = TrustRoots::from_pem(bundle.as_bytes()).unwrap();
        assert_eq!(roots.len(), 2);

        assert!(TrustRoots::from_pem(b"not pem").is_err());
    }

    mod tls {
        use super::*;
        use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
        use std::net::SocketAddr;
        use tokio::net::TcpListener;

        fn leaf(
            issuer: &rcgen::Certificate,
            issuer_key: &rcgen::KeyPair,
        ) -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
            let params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
            let key = rcgen::KeyPair::generate().unwrap();
            let cert = params.signed_by(&key, issuer, issuer_key).unwrap();
            (
                cert.der().clone(),
                PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
            )
        }

        async fn receiver(
            cert: CertificateDer<'static>,
            key: PrivateKeyDer<'static>,
        ) -> SocketAddr {
            let config = rustls::ServerConfig::builder_with_provider(Arc::new(
                rustls::crypto::ring::default_provider(),
            ))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)
            .unwrap();
            let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));

            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                while let Ok((tcp, _)) = listener.accept().await {
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        if let Ok(mut stream) = acceptor.accept(tcp).await {
                            let mut buf = [0u8; 1024];
                            let _ = stream.read(&mut buf).await;
                            let _ = stream
                                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                                .await;
                            let _ = stream.shutdown().await;
                        }
                    });
                }
            });
            addr
        }

        #[tokio::test]
        async fn test_tls_probe_follows_trust_roots() {
            let (ca_cert, ca_key) = ca("receiver-ca");
            let (other_ca, _) = ca("unrelated-ca");
            let (cert, key) = leaf(&ca_cert, &ca_key);
            let addr = receiver(cert, key).await;

            let address = CandidateAddress::tls("localhost", addr.port(), "/events/default");
            let trusted = TrustRoots::from_certs(vec![ca_cert.der().clone()]).unwrap();
            let untrusted = TrustRoots::from_certs(vec![other_ca.der().clone()]).unwrap();

            let transport = HttpProbeTransport;
            assert!(transport.probe(&address, &trusted).await);
            assert!(!transport.probe(&address, &untrusted).await);

            let prober = Prober::new(fast_config(), Arc::new(HttpProbeTransport), trusted.clone());
            prober.is_ready(&address);
            eventually(|| prober.is_ready(&address)).await;

            prober.rotate_trust_roots(untrusted);
            assert!(!prober.is_ready(&address));
            eventually(|| prober.status(&address) == ProbeStatus::NotReady).await;

            prober.rotate_trust_roots(trusted);
            eventually(|| prober.is_ready(&address)).await;
        }

        #[tokio::test]
        async fn test_plain_probe_checks_status_code() {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                let mut served = 0;
                while let Ok((mut tcp, _)) = listener.accept().await {
                    let mut buf = [0u8; 1024];
                    let _ = tcp.read(&mut buf).await;
                    let response: &[u8] = if served == 0 {
                        b"HTTP/1.1 503 Service Unavailable\r\n\r\n"
                    } else {
                        b"HTTP/1.1 200 OK\r\n\r\n"
                    };
                    let _ = tcp.write_all(response).await;
                    served += 1;
                }
            });

            let address = CandidateAddress::plain("127.0.0.1", addr.port(), "/events/default");
            let transport = HttpProbeTransport;
            assert!(!transport.probe(&address, &TrustRoots::empty()).await);
            assert!(transport.probe(&address, &TrustRoots::empty()).await);
        }

        #[tokio::test]
        async fn test_unreachable_address_is_not_ready() {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            drop(listener);

            let address = CandidateAddress::plain("127.0.0.1", port, "/");
            assert!(!HttpProbeTransport.probe(&address, &TrustRoots::empty()).await);
        }
    }
}
