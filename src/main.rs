use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use prometheus::Registry;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower::Layer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use rategate::config::RategateConfig;
use rategate::http::{
    LimiterLayer, MetricsEndpoint, MetricsLayer, ProxyServer, RequestMetrics, ReverseProxy,
};
use rategate::ratelimit::{Acquirer, KeyedLocalAdmitter, LoggingAcquirer, NextIntervalWaiter};

/// Reverse proxy that admits a fixed number of requests per path per interval.
#[derive(Debug, Parser)]
#[command(name = "rategate", version)]
struct Args {
    /// URL admitted requests are forwarded to
    proxied_url: Option<String>,

    /// Port to listen on [default: 4040]
    #[arg(long)]
    port: Option<u16>,

    /// Port serving Prometheus metrics [default: 9090]
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Requests admitted per path per interval [default: 100]
    #[arg(long)]
    rpm: Option<u64>,

    /// Comma separated etcd endpoints; counts stay in process when empty
    #[arg(long, value_delimiter = ',')]
    etcd_addresses: Vec<String>,

    /// Default log filter [default: debug]
    #[arg(long)]
    log_level: Option<String>,

    /// Interval length in seconds [default: 60]
    #[arg(long)]
    interval_secs: Option<u64>,

    /// Bind each interval record in etcd to an expiring lease
    #[arg(long)]
    lease: bool,

    /// YAML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,
}

impl Args {
    fn apply(self, config: &mut RategateConfig) {
        if let Some(url) = self.proxied_url {
            config.server.upstream = Some(url);
        }
        if let Some(port) = self.port {
            config.server.listen_addr.set_port(port);
        }
        if let Some(port) = self.metrics_port {
            config.server.metrics_port = Some(port);
        }
        if let Some(rpm) = self.rpm {
            config.rate_limiting.requests_per_interval = rpm;
        }
        if !self.etcd_addresses.is_empty() {
            config.store.etcd_endpoints = self.etcd_addresses;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        if let Some(secs) = self.interval_secs {
            config.rate_limiting.interval_secs = secs;
        }
        config.store.use_lease |= self.lease;
        config.logging.json |= self.log_json;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = RategateConfig::load(args.config.as_deref())?;
    args.apply(&mut config);

    init_tracing(&config)?;

    info!("Starting Rategate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    config.validate()?;
    let upstream = config.server.upstream.clone().unwrap_or_default();
    info!(
        listen_addr = %config.server.listen_addr,
        upstream = %upstream,
        requests_per_interval = config.rate_limiting.requests_per_interval,
        interval = ?config.rate_limiting.interval(),
        "Configuration loaded"
    );

    let acquirer = build_acquirer(&config).await?;
    let waiter = Arc::new(NextIntervalWaiter::new(config.rate_limiting.interval()));
    let proxy = ReverseProxy::new(upstream.parse::<http::Uri>().context("invalid upstream URL")?)?;
    let registry = Registry::new();
    let metrics = RequestMetrics::register(&registry)?;
    let service = MetricsLayer::new(metrics)
        .layer(LimiterLayer::new(acquirer).with_waiter(waiter).layer(proxy));

    let stop_metrics = CancellationToken::new();
    let metrics_task = match config.server.metrics_addr() {
        Some(addr) => {
            let server = ProxyServer::bind(addr, MetricsEndpoint::new(registry)).await?;
            info!("Serving metrics on {}", server.local_addr()?);
            let token = stop_metrics.clone();
            Some(tokio::spawn(
                server.serve_with_shutdown(async move { token.cancelled().await }),
            ))
        }
        None => None,
    };

    let addr: SocketAddr = config.server.listen_addr;
    let server = ProxyServer::bind(addr, service).await?;
    info!("Listening on {}", server.local_addr()?);

    server.serve_with_shutdown(shutdown_signal()).await?;

    stop_metrics.cancel();
    if let Some(task) = metrics_task {
        task.await??;
    }

    info!("Rategate stopped");
    Ok(())
}

fn init_tracing(config: &RategateConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.logging.level)
            .with_context(|| format!("invalid log level {:?}", config.logging.level))?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

/// In process per-path buckets, or the shared store when endpoints are set.
async fn build_acquirer(config: &RategateConfig) -> anyhow::Result<Arc<dyn Acquirer>> {
    let limit = config.rate_limiting.requests_per_interval;
    let interval = config.rate_limiting.interval();

    if config.store.etcd_endpoints.is_empty() {
        info!(limit, interval = ?interval, "Using in-process admitter");
        let admitter = KeyedLocalAdmitter::new(limit, interval)?;
        return Ok(Arc::new(LoggingAcquirer::new(admitter)));
    }

    distributed_acquirer(config).await
}

#[cfg(feature = "etcd")]
async fn distributed_acquirer(config: &RategateConfig) -> anyhow::Result<Arc<dyn Acquirer>> {
    use rategate::ratelimit::DistributedAdmitter;
    use rategate::store::EtcdStore;

    let store = EtcdStore::connect(&config.store.etcd_endpoints)
        .await?
        .with_min_lease_ttl(config.store.min_lease_ttl());
    info!(
        endpoints = ?config.store.etcd_endpoints,
        use_lease = config.store.use_lease,
        "Using etcd admitter"
    );

    let admitter = DistributedAdmitter::new(Arc::new(store), config.distributed())?;
    Ok(Arc::new(LoggingAcquirer::new(admitter)))
}

#[cfg(not(feature = "etcd"))]
async fn distributed_acquirer(_config: &RategateConfig) -> anyhow::Result<Arc<dyn Acquirer>> {
    anyhow::bail!("etcd endpoints configured but rategate was built without the `etcd` feature")
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
