use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "inspect")]
mod api;
mod cache;
mod config;
mod dns;
mod geoip;
mod marks;
mod packet;
mod pipeline;
mod proc;
mod proto;
mod queue;
mod rules;
mod state;

use config::{CliArgs, Config};
use packet::Family;
use queue::{QueueConfig, QueueWorker};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = CliArgs::parse();

    // Load config from file if provided, otherwise use defaults.
    let mut config = if let Some(ref config_path) = cli.config {
        Config::from_file(Path::new(config_path))?
    } else {
        Config::default()
    };
    config.merge_cli(&cli);

    // Logging: the append-only log file plus stderr.
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.log_file)
        .with_context(|| format!("opening log file {}", config.log_file))?;
    let filter = if config.quiet {
        tracing_subscriber::EnvFilter::new("error")
    } else {
        tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        )
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(log_file)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // ── Enrichment state ──────────────────────────────────────────────
    // Geo databases open before anything touches the kernel; a failure
    // here exits before rules are installed or sockets opened.
    let geo = Arc::new(geoip::GeoResolver::open(
        Path::new(&config.country_db),
        Path::new(&config.asn_db),
    )?);

    let verdicts = Arc::new(cache::VerdictCache::new(Duration::from_secs(
        config.verdict_ttl_seconds,
    )));
    let procs = Arc::new(proc::ProcTable::new(Duration::from_secs(
        config.process_ttl_seconds,
    )));
    let registry = Arc::new(state::ConnectionRegistry::new());

    let dns_cache = if config.resolve_dns {
        info!("Reverse DNS resolution enabled");
        Some(Arc::new(dns::DnsCache::new(
            Duration::from_secs(300),
            Duration::from_secs(2),
        )))
    } else {
        None
    };

    let decision: pipeline::DecisionFn = Arc::new(pipeline::accept_always);
    let pipeline = Arc::new(pipeline::Pipeline::new(
        geo,
        procs.clone(),
        verdicts.clone(),
        registry.clone(),
        decision,
        dns_cache,
    ));

    // ── Shutdown signal ───────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("installing SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        info!("Shutting down...");
        let _ = shutdown_tx.send(true);
    });

    // ── Inspection endpoint ───────────────────────────────────────────
    #[cfg(feature = "inspect")]
    {
        let app_state = Arc::new(api::AppState {
            registry: registry.clone(),
            verdicts: verdicts.clone(),
            start_time: std::time::Instant::now(),
        });
        let app = api::router(app_state, &config.api_allowed_ips);
        let listener = tokio::net::TcpListener::bind(&config.api_listen)
            .await
            .with_context(|| format!("binding inspection endpoint to {}", config.api_listen))?;
        info!("Inspection endpoint on http://{}", config.api_listen);
        let mut api_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let serve = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = api_shutdown.changed().await;
            });
            if let Err(e) = serve.await {
                error!(error = %e, "inspection endpoint failed");
            }
        });
    }

    // ── Kernel ruleset ────────────────────────────────────────────────
    // Everything after this point must unwind it, success or failure.
    rules::install(config.queue_v4, config.queue_v6)?;
    info!(
        queue_v4 = config.queue_v4,
        queue_v6 = config.queue_v6,
        "kernel rules installed"
    );

    let result = run_datapath(&config, pipeline, verdicts, procs, registry, shutdown_rx).await;

    info!("Removing kernel rules");
    if let Err(e) = rules::cleanup() {
        error!(error = %e, "kernel rule cleanup incomplete");
    }
    result
}

/// Open both family workers, start the cache maintenance timer, and run
/// until shutdown. A worker that fails to open aborts the other before the
/// caller removes the kernel rules.
async fn run_datapath(
    config: &Config,
    pipeline: Arc<pipeline::Pipeline>,
    verdicts: Arc<cache::VerdictCache>,
    procs: Arc<proc::ProcTable>,
    registry: Arc<state::ConnectionRegistry>,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let worker_v4 = QueueWorker::open(
        QueueConfig {
            queue_num: config.queue_v4,
            family: Family::V4,
            max_packet_len: config.max_packet_len,
            max_queue_len: config.queue_max_len,
            capacity: config.capacity,
        },
        pipeline.clone(),
    )
    .context("opening IPv4 queue")?;
    let worker_v6 = QueueWorker::open(
        QueueConfig {
            queue_num: config.queue_v6,
            family: Family::V6,
            max_packet_len: config.max_packet_len,
            max_queue_len: config.queue_max_len,
            capacity: config.capacity,
        },
        pipeline.clone(),
    )
    .context("opening IPv6 queue")?;

    // ── Cache maintenance ─────────────────────────────────────────────
    let connection_timeout = Duration::from_secs(config.connection_timeout);
    let mut maint_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let expired = verdicts.evict_expired();
                    let stale_procs = procs.evict_expired();
                    let stale_conns = registry.cleanup_stale(connection_timeout);
                    if expired + stale_procs + stale_conns > 0 {
                        debug!(
                            verdicts = expired,
                            processes = stale_procs,
                            connections = stale_conns,
                            "evicted expired cache entries"
                        );
                    }
                }
                _ = maint_shutdown.changed() => break,
            }
        }
    });

    let (r4, r6) = tokio::join!(
        worker_v4.run(shutdown_rx.clone()),
        worker_v6.run(shutdown_rx)
    );
    r4?;
    r6?;
    Ok(())
}
