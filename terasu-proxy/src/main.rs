mod auth;
mod config;
mod metrics;
mod mitm;
mod proxy;
mod rules;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use terasu_core::dns::Resolver;
use terasu_core::{DnsMode, Egress, FragTlsConnector};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Idle egress connections are kept pooled this long.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Parser)]
#[command(name = "terasu-proxy")]
#[command(version)]
#[command(about = "Intercepting HTTPS forward proxy with a fragmented-ClientHello egress", long_about = None)]
struct Cli {
    /// Path to the YAML config file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load(cli.config.as_deref()).context("load config")?;
    init_tracing(&cfg.logging.level);

    // Install ring as the default CryptoProvider before any TLS usage.
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("install default CryptoProvider");

    info!(listen = %cfg.listen, mode = %cfg.mode, dns = %cfg.dns.mode, "starting terasu-proxy");

    let ca = Arc::new(
        mitm::Ca::load_or_create(&cfg.ca.cert_file, &cfg.ca.key_file, cfg.ca.auto_generate)
            .context("initialize CA")?,
    );
    let cert_store = Arc::new(mitm::CertStore::new(ca));

    let first_len = cfg.fragment.first_len;
    let resolver = Resolver::new(first_len).context("initialize resolver")?;
    resolver.pool().set_dot_timeout(cfg.dns.dot_timeout);
    let egress = Arc::new(Egress::new(
        resolver,
        DnsMode::parse(&cfg.dns.mode),
        first_len,
    ));
    let client = Client::builder(TokioExecutor::new())
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .build(FragTlsConnector::new(egress));

    let aggregator = Arc::new(metrics::Aggregator::new());

    let ctx = Arc::new(proxy::ProxyCtx {
        auth: auth::BasicAuth {
            enabled: cfg.security.basic_auth.enabled,
            username: cfg.security.basic_auth.username.clone(),
            password: cfg.security.basic_auth.password.clone(),
        },
        rules: rules::Rules::new(&cfg.mode, &cfg.intercept_list),
        client,
        metrics: Arc::clone(&aggregator),
        tls_server: proxy::mitm_server_config(cert_store),
        read_timeout: cfg.limits.read_timeout,
        write_timeout: cfg.limits.write_timeout,
        max_conns: cfg.limits.max_conns,
    });

    let listener = TcpListener::bind(&cfg.listen)
        .await
        .with_context(|| format!("listen on {}", cfg.listen))?;
    info!("listening on {}", cfg.listen);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if let Some(addr) = cfg.metrics.addr.clone() {
        let agg = Arc::clone(&aggregator);
        let rx = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(err) = metrics::server::run(&addr, agg, rx).await {
                error!("metrics server failed: {err:#}");
            }
        });
    }

    tokio::spawn(shutdown_signal(shutdown_tx));

    proxy::run(ctx, listener, shutdown_rx).await?;
    info!("server shut down");
    Ok(())
}

async fn shutdown_signal(tx: watch::Sender<bool>) {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("register SIGTERM handler");
    tokio::select! {
        result = signal::ctrl_c() => {
            match result {
                Ok(()) => info!("received SIGINT, shutting down"),
                Err(err) => {
                    error!("failed to listen for SIGINT: {err}");
                    return;
                }
            }
        }
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
    }
    let _ = tx.send(true);
}

fn init_tracing(level: &str) {
    let level = match level {
        // logrus levels with no tracing equivalent
        "fatal" | "panic" => "error",
        "" => "info",
        other => other,
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
