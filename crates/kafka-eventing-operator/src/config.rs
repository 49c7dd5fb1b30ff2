//! Operator configuration
//!
//! Defaults live here; the binary overrides them from flags and environment.

use std::path::PathBuf;
use std::time::Duration;

/// Default namespace of the data plane and the contract ConfigMap
pub const DEFAULT_SYSTEM_NAMESPACE: &str = "knative-eventing";

/// Default name of the contract ConfigMap
pub const DEFAULT_CONTRACT_CONFIG_MAP: &str = "kafka-broker-brokers-triggers";

/// Readiness prober timings
#[derive(Debug, Clone, PartialEq)]
pub struct ProberConfig {
    /// Upper bound for a single probe
    pub timeout: Duration,
    /// Age after which a ready result is re-probed
    pub refresh_interval: Duration,
    /// First retry delay after a failed probe
    pub backoff_base: Duration,
    /// Cap for the retry delay
    pub backoff_max: Duration,
    /// Consecutive failures before a warning is logged
    pub warn_after_attempts: u32,
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            refresh_interval: Duration::from_secs(60),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            warn_after_attempts: 10,
        }
    }
}

impl ProberConfig {
    /// Delay before the next probe after `failures` consecutive failures
    /// (`base * 2^(failures - 1)`, capped at `backoff_max`)
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(20);
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.backoff_max)
    }
}

/// Where the data-plane receivers listen
#[derive(Debug, Clone, PartialEq)]
pub struct IngressConfig {
    /// Namespace of the receiver service
    pub namespace: String,
    /// Name of the receiver service
    pub service: String,
    /// Plain HTTP port
    pub http_port: u16,
    /// HTTPS port
    pub https_port: u16,
    /// Whether receivers are probed and addressed over TLS
    pub tls: bool,
    /// Cluster DNS suffix
    pub cluster_domain: String,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_SYSTEM_NAMESPACE.to_string(),
            service: "kafka-broker-ingress".to_string(),
            http_port: 80,
            https_port: 443,
            tls: false,
            cluster_domain: "cluster.local".to_string(),
        }
    }
}

impl IngressConfig {
    /// Fully qualified host of the receiver service
    pub fn host(&self) -> String {
        service_hostname(&self.service, &self.namespace, &self.cluster_domain)
    }

    /// Port probed for the configured scheme
    pub fn port(&self) -> u16 {
        if self.tls {
            self.https_port
        } else {
            self.http_port
        }
    }
}

/// `<service>.<namespace>.svc.<domain>`
pub fn service_hostname(service: &str, namespace: &str, domain: &str) -> String {
    format!("{}.{}.svc.{}", service, namespace, domain)
}

/// Control-plane configuration
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorConfig {
    /// Namespace holding the contract ConfigMap
    pub system_namespace: String,
    /// Name of the contract ConfigMap
    pub contract_config_map: String,
    /// Bootstrap servers used when a resource does not set its own
    pub default_bootstrap_servers: String,
    /// PEM bundle with the trust roots for TLS probes
    pub trust_bundle: Option<PathBuf>,
    /// Receiver addressing
    pub ingress: IngressConfig,
    /// Prober timings
    pub prober: ProberConfig,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            system_namespace: DEFAULT_SYSTEM_NAMESPACE.to_string(),
            contract_config_map: DEFAULT_CONTRACT_CONFIG_MAP.to_string(),
            default_bootstrap_servers: "my-cluster-kafka-bootstrap.kafka:9092".to_string(),
            trust_bundle: None,
            ingress: IngressConfig::default(),
            prober: ProberConfig::default(),
        }
    }
}
