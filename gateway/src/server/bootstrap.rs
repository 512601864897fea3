use crate::config::GatewayConfig;
use crate::metrics::Metrics;
use crate::server::{self, Gateway};
use anyhow::Result;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: String,
    pub admin_listen: String,
}

/// Gateway lifecycle: init → wait for backends → loops → serve → shutdown.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    let _log_guard = init_tracing();

    // Phase 1: build state.
    let config = GatewayConfig::load(&args.config_path)?;
    let metrics = Metrics::install()?;
    let gw = Gateway::from_config(config)?.with_metrics(metrics);

    // Phase 2: first health round, then give each backend a bounded window
    // to come up. Startup proceeds either way; unhealthy services answer 503.
    wait_for_services(&gw).await;

    // Phase 3: background loops, all owned here.
    let shutdown = Arc::new(Notify::new());
    start_health_check_loop(&gw, &shutdown);
    start_monitor_loop(&gw, &shutdown);

    // Phase 4: admin + proxy servers.
    start_admin_server(&gw, &args, &shutdown);

    tracing::info!("server: starting gateway, listen={}", args.listen);
    let proxy_handle = tokio::spawn({
        let listen = args.listen.clone();
        let gw = gw.clone();
        let shutdown = shutdown.clone();
        async move { server::run_proxy_server(&listen, gw, shutdown).await }
    });

    // Phase 5: block until signal, then drain.
    wait_for_shutdown(&shutdown).await?;

    match proxy_handle.await {
        Ok(Err(e)) => tracing::error!("server: proxy failed, error={}", e),
        Err(e) => tracing::error!("server: proxy task error: {}", e),
        Ok(Ok(())) => {}
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

/// JSON logs to stdout through a non-blocking writer. The guard must live
/// for the whole process so buffered lines are flushed on exit.
fn init_tracing() -> tracing_appender::non_blocking::WorkerGuard {
    let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    guard
}

async fn wait_for_services(gw: &Gateway) {
    let health = gw.health();
    health.check_all().await;

    let timeout = Duration::from_millis(gw.config().health_check.startup_timeout_ms);
    let services = gw.registry().list();
    let results = join_all(services.iter().map(|d| async move {
        let healthy = gw.registry().is_healthy(&d.name)
            || health.wait_until_healthy(&d.name, timeout).await;
        (d.name.clone(), healthy)
    }))
    .await;

    let ready = results.iter().filter(|(_, ok)| *ok).count();
    for (name, healthy) in &results {
        if !healthy {
            tracing::warn!("bootstrap: starting without healthy backend, service={}", name);
        }
    }
    tracing::info!(
        "bootstrap: initial health resolved, healthy={}, total={}",
        ready,
        results.len()
    );
}

async fn sleep_or_shutdown(duration: Duration, shutdown: &Notify) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.notified() => true,
    }
}

fn start_health_check_loop(gw: &Gateway, shutdown: &Arc<Notify>) {
    let health = gw.health().clone();
    let interval = Duration::from_secs(gw.config().health_check.interval_secs.max(1));
    let shutdown = shutdown.clone();

    tokio::spawn(async move {
        loop {
            if sleep_or_shutdown(interval, &shutdown).await {
                return;
            }
            health.check_round().await;
        }
    });
}

fn start_monitor_loop(gw: &Gateway, shutdown: &Arc<Notify>) {
    let gw = gw.clone();
    let interval = Duration::from_secs(gw.config().monitor.interval_secs.max(1));
    let shutdown = shutdown.clone();

    tokio::spawn(async move {
        loop {
            if sleep_or_shutdown(interval, &shutdown).await {
                return;
            }
            let report = gw.monitor().tick();
            tracing::debug!(
                "monitor: tick, status={}, alerts={}",
                report.status.as_str(),
                report.alerts.len()
            );
            gw.routes().evict_stale();
        }
    });
}

fn start_admin_server(gw: &Gateway, args: &BootstrapArgs, shutdown: &Arc<Notify>) {
    let gw = gw.clone();
    let admin_addr = args.admin_listen.clone();
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = server::run_admin_server(&admin_addr, gw, shutdown).await {
            tracing::error!("server: admin failed, error={}", e);
        }
    });
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) -> Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let terminate = sigterm.recv();

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }

    // Signal all background loops to stop.
    shutdown.notify_waiters();
    Ok(())
}
