//! Rivven Pub/Sub Operator
//!
//! Reconciles RivvenPullSubscription resources: a Pub/Sub subscription per
//! resource plus a receive adapter Deployment pushing messages to the sink.

use anyhow::{Context, Result};
use clap::Parser;
use kube::Client;
use rivven_pubsub_operator::controller::{run_controller, ControllerConfig};
use rivven_pubsub_operator::pubsub_client::{PubSubAdminConfig, RestMessagingAdmin};
use rivven_pubsub_operator::reconciler::{Reconciler, ReconcilerConfig, DEFAULT_ADAPTER_IMAGE};
use rivven_pubsub_operator::resolver::KubeAddressResolver;
use rivven_pubsub_operator::workload::{KedaBindingAdmin, KubeWorkloadAdmin};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

/// Rivven Pub/Sub Operator
#[derive(Parser, Debug)]
#[command(name = "rivven-pubsub-operator")]
#[command(about = "Kubernetes operator binding Google Cloud Pub/Sub topics to event sinks")]
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

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Enable JSON log format
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    log_json: bool,

    /// Print CRD YAML and exit
    #[arg(long)]
    print_crd: bool,

    /// Receive adapter image
    #[arg(long, env = "ADAPTER_IMAGE", default_value = DEFAULT_ADAPTER_IMAGE)]
    adapter_image: String,

    /// Project used when a resource names none
    #[arg(long, env = "DEFAULT_PROJECT_ID")]
    default_project: Option<String>,

    /// Pub/Sub API endpoint (ignored when PUBSUB_EMULATOR_HOST is set)
    #[arg(long, env = "PUBSUB_ENDPOINT")]
    pubsub_endpoint: Option<String>,

    /// Requeue interval for ready resources
    #[arg(long, env = "RESYNC_INTERVAL", default_value = "5m", value_parser = humantime::parse_duration)]
    resync_interval: Duration,

    /// Upper bound for a single reconcile pass
    #[arg(long, env = "PASS_DEADLINE", default_value = "60s", value_parser = humantime::parse_duration)]
    pass_deadline: Duration,

    /// First retry delay after a failed pass
    #[arg(long, env = "BACKOFF_BASE", default_value = "5s", value_parser = humantime::parse_duration)]
    backoff_base: Duration,

    /// Retry delay cap
    #[arg(long, env = "BACKOFF_MAX", default_value = "5m", value_parser = humantime::parse_duration)]
    backoff_max: Duration,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle CRD printing
    if args.print_crd {
        print_crd()?;
        return Ok(());
    }

    // Initialize logging
    init_logging(&args)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = if args.namespace.is_empty() {
            "all"
        } else {
            &args.namespace
        },
        adapter_image = %args.adapter_image,
        "Starting Rivven Pub/Sub Operator"
    );

    // Initialize metrics
    let metrics_addr = args.metrics_addr;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_addr).await {
            tracing::error!(error = %e, "Metrics server failed");
        }
    });

    // Start health server
    let health_addr = args.health_addr;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_addr).await {
            tracing::error!(error = %e, "Health server failed");
        }
    });

    // Create Kubernetes client
    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    // Pub/Sub admin and capability wiring
    let messaging = RestMessagingAdmin::new(PubSubAdminConfig::from_env(args.pubsub_endpoint))
        .context("Failed to create Pub/Sub admin")?;

    let reconciler = Reconciler::new(
        Arc::new(KubeAddressResolver::new(client.clone())),
        Arc::new(messaging),
        Arc::new(KubeWorkloadAdmin::new(client.clone())),
        Arc::new(KedaBindingAdmin::new(client.clone())),
        ReconcilerConfig {
            adapter_image: args.adapter_image,
            default_project: args.default_project.filter(|p| !p.is_empty()),
        },
    );

    let config = ControllerConfig {
        resync_interval: args.resync_interval,
        pass_deadline: args.pass_deadline,
        backoff_base: args.backoff_base,
        backoff_max: args.backoff_max,
        ..Default::default()
    };

    // Parse namespace (empty string means cluster-wide)
    let namespace = if args.namespace.is_empty() {
        None
    } else {
        Some(args.namespace)
    };

    // Run the controller
    run_controller(client, namespace, reconciler, config)
        .await
        .context("Controller failed")?;

    Ok(())
}

/// Initialize logging subsystem
fn init_logging(args: &Args) -> Result<()> {
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

    Ok(())
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

/// Print the CRD YAML for installation
fn print_crd() -> Result<()> {
    use kube::CustomResourceExt;
    use rivven_pubsub_operator::crd::RivvenPullSubscription;

    let crd = RivvenPullSubscription::crd();
    let yaml = serde_yaml::to_string(&crd)?;
    println!("{}", yaml);

    Ok(())
}
