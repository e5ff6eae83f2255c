use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use nswarden_controller::Controller;
use nswarden_kubehub::KubeNamespaceClient;
use nswarden_policy::Policy;
use nswarden_store::InformerConfig;
use tokio::sync::{oneshot, watch};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "nswarden", version, about = "Namespace policy watch-and-reconcile controller")]
struct Cli {
    /// Path to the YAML policy file
    #[arg(short = 'c', long = "config")]
    config: PathBuf,

    /// Full re-list interval in seconds, bounding cache staleness
    #[arg(long = "resync-secs", default_value_t = 180)]
    resync_secs: u64,
}

fn init_tracing() {
    let env = std::env::var("NSWARDEN_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("NSWARDEN_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid NSWARDEN_METRICS_ADDR; expected host:port");
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    // Invalid configuration is a hard startup failure; never run degraded.
    let policy = match Policy::load(&cli.config) {
        Ok(p) => Arc::new(p),
        Err(e) => {
            error!(error = ?e, "policy load failed");
            eprintln!("nswarden: invalid policy configuration: {e:#}");
            std::process::exit(1);
        }
    };

    let client = match KubeNamespaceClient::try_default().await {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!(error = ?e, "cluster client setup failed");
            eprintln!("nswarden: cannot reach cluster API: {e:#}");
            std::process::exit(1);
        }
    };

    let cfg = InformerConfig {
        resync_interval: Duration::from_secs(cli.resync_secs.max(1)),
        ..InformerConfig::default()
    };
    let controller = Controller::new(client, policy, cfg);

    let (stop_tx, stop_rx) = watch::channel(false);
    let (done_tx, done_rx) = oneshot::channel();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        let _ = stop_tx.send(true);
    });

    controller.run(stop_rx, done_tx).await;
    let _ = done_rx.await;
    info!("bye");
}
