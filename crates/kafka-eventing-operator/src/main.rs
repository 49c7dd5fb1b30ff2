//! Kafka eventing operator
//!
//! Reconciles Kafka brokers, triggers, channels and sinks into the routing
//! contract consumed by the data plane.

use anyhow::{Context, Result};
use clap::Parser;
use kafka_eventing_operator::config::{
    IngressConfig, OperatorConfig, ProberConfig, DEFAULT_CONTRACT_CONFIG_MAP,
    DEFAULT_SYSTEM_NAMESPACE,
};
use kafka_eventing_operator::prelude::*;
use kube::Client;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;

/// Kafka eventing operator
#[derive(Parser, Debug)]
#[command(name = "kafka-eventing-operator")]
#[command(about = "Kubernetes control plane for Kafka-backed eventing")]
#[command(version)]
struct Args {
    /// Metrics server address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Health probe address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Namespace to watch (empty for cluster-wide)
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    namespace: String,

    /// Namespace of the data plane and the contract ConfigMap
    #[arg(long, env = "SYSTEM_NAMESPACE", default_value = DEFAULT_SYSTEM_NAMESPACE)]
    system_namespace: String,

    /// Name of the contract ConfigMap
    #[arg(long, env = "CONTRACT_CONFIG_MAP", default_value = DEFAULT_CONTRACT_CONFIG_MAP)]
    contract_config_map: String,

    /// Receiver service name
    #[arg(long, env = "INGRESS_SERVICE", default_value = "kafka-broker-ingress")]
    ingress_service: String,

    /// Receiver HTTP port
    #[arg(long, env = "INGRESS_HTTP_PORT", default_value = "80")]
    ingress_http_port: u16,

    /// Receiver HTTPS port
    #[arg(long, env = "INGRESS_HTTPS_PORT", default_value = "443")]
    ingress_https_port: u16,

    /// Address and probe receivers over TLS
    #[arg(long, env = "INGRESS_TLS", default_value = "false")]
    ingress_tls: bool,

    /// Cluster DNS suffix
    #[arg(long, env = "CLUSTER_DOMAIN", default_value = "cluster.local")]
    cluster_domain: String,

    /// Kafka bootstrap servers for resources that do not set their own
    #[arg(
        long,
        env = "DEFAULT_BOOTSTRAP_SERVERS",
        default_value = "my-cluster-kafka-bootstrap.kafka:9092"
    )]
    default_bootstrap_servers: String,

    /// PEM bundle with the CAs trusted for TLS probes; watched for changes
    #[arg(long, env = "TRUST_BUNDLE")]
    trust_bundle: Option<PathBuf>,

    /// Timeout of a single readiness probe in milliseconds
    #[arg(long, env = "PROBE_TIMEOUT_MS", default_value = "2000")]
    probe_timeout_ms: u64,

    /// Age in seconds after which a ready result is re-probed
    #[arg(long, env = "PROBE_REFRESH_SECS", default_value = "60")]
    probe_refresh_secs: u64,

    /// First retry delay after a failed probe in milliseconds
    #[arg(long, env = "PROBE_BACKOFF_BASE_MS", default_value = "500")]
    probe_backoff_base_ms: u64,

    /// Maximum retry delay in milliseconds
    #[arg(long, env = "PROBE_BACKOFF_MAX_MS", default_value = "30000")]
    probe_backoff_max_ms: u64,

    /// Consecutive probe failures before a warning
    #[arg(long, env = "PROBE_WARN_AFTER", default_value = "10")]
    probe_warn_after: u32,

    /// Publish an empty drain contract on shutdown
    #[arg(long, env = "DRAIN_ON_SHUTDOWN", default_value = "false")]
    drain_on_shutdown: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Enable JSON log format
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    log_json: bool,

    /// Print CRD YAML and exit
    #[arg(long)]
    print_crd: bool,
}

impl Args {
    fn operator_config(&self) -> OperatorConfig {
        OperatorConfig {
            system_namespace: self.system_namespace.clone(),
            contract_config_map: self.contract_config_map.clone(),
            default_bootstrap_servers: self.default_bootstrap_servers.clone(),
            trust_bundle: self.trust_bundle.clone(),
            ingress: IngressConfig {
                namespace: self.system_namespace.clone(),
                service: self.ingress_service.clone(),
                http_port: self.ingress_http_port,
                https_port: self.ingress_https_port,
                tls: self.ingress_tls,
                cluster_domain: self.cluster_domain.clone(),
            },
            prober: ProberConfig {
                timeout: Duration::from_millis(self.probe_timeout_ms),
                refresh_interval: Duration::from_secs(self.probe_refresh_secs),
                backoff_base: Duration::from_millis(self.probe_backoff_base_ms),
                backoff_max: Duration::from_millis(self.probe_backoff_max_ms),
                warn_after_attempts: self.probe_warn_after,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle CRD printing
    if args.print_crd {
        print_crd()?;
        return Ok(());
    }

    init_logging(&args);
    let config = args.operator_config();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = if args.namespace.is_empty() {
            "all"
        } else {
            &args.namespace
        },
        contract = %format!("{}/{}", config.system_namespace, config.contract_config_map),
        "Starting Kafka eventing operator"
    );

    let metrics_addr = args.metrics_addr;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_addr).await {
            tracing::error!(error = %e, "Metrics server failed");
        }
    });

    let health_addr = args.health_addr;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_addr).await {
            tracing::error!(error = %e, "Health server failed");
        }
    });

    let resync = ResyncSignal::new();

    // Trust roots
    let (roots, bundle) = match &config.trust_bundle {
        Some(path) => {
            let bundle = std::fs::read(path)
                .with_context(|| format!("Failed to read trust bundle {}", path.display()))?;
            let roots = TrustRoots::from_pem(&bundle).context("Invalid trust bundle")?;
            (roots, Some(bundle))
        }
        None => {
            if config.ingress.tls {
                warn!("Ingress uses TLS but no trust bundle is configured; TLS probes will fail");
            }
            (TrustRoots::empty(), None)
        }
    };
    let prober = Prober::new(config.prober.clone(), Arc::new(HttpProbeTransport), roots);
    {
        let resync = resync.clone();
        prober.on_ready(move |address| {
            info!(address = %address, "Address became ready");
            resync.trigger("address ready");
        });
    }
    if let Some(path) = config.trust_bundle.clone() {
        spawn_trust_bundle_watcher(path, bundle, prober.clone(), resync.clone())
            .context("Failed to watch trust bundle")?;
    }

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    // Without the contract ConfigMap there is nothing to publish into.
    let storage = ConfigMapStorage::new(
        client.clone(),
        &config.system_namespace,
        &config.contract_config_map,
    );
    let sync = Arc::new(
        ContractSync::start(storage, prober)
            .await
            .context("Failed to get or create the contract ConfigMap")?,
    );

    tokio::spawn(watch_contract_storage(
        client.clone(),
        Arc::clone(&sync),
        resync.clone(),
    ));

    let fragments = FragmentContext {
        ingress: config.ingress.clone(),
        default_bootstrap_servers: config.default_bootstrap_servers.clone(),
    };
    let ctx = Arc::new(ControllerContext::new(client, Arc::clone(&sync), fragments));

    let namespace = if args.namespace.is_empty() {
        None
    } else {
        Some(args.namespace.clone())
    };

    tokio::select! {
        result = run_controllers(ctx, namespace, resync) => {
            result.context("Controllers failed")?;
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    if args.drain_on_shutdown {
        sync.close()
            .await
            .context("Failed to publish the drain contract")?;
    }

    info!("Operator stopped");
    Ok(())
}

/// Initialize logging subsystem
fn init_logging(args: &Args) {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(false);

    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Start the Prometheus metrics server
async fn start_metrics_server(addr: SocketAddr) -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    info!(address = %addr, "Starting metrics server");

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    // Keep the server running
    std::future::pending::<()>().await;

    Ok(())
}

/// Start the health probe server
async fn start_health_server(addr: SocketAddr) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    info!(address = %addr, "Starting health server");

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind health server")?;

    loop {
        let (mut socket, _) = listener.accept().await?;

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            if socket.read(&mut buf).await.is_ok() {
                let response = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK";
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Print the CRD YAML for installation
fn print_crd() -> Result<()> {
    use kube::CustomResourceExt;

    let crds = [
        KafkaBroker::crd(),
        KafkaTrigger::crd(),
        KafkaChannel::crd(),
        KafkaSink::crd(),
        KafkaConsumerGroup::crd(),
    ];
    for crd in crds {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd)?);
    }

    Ok(())
}
