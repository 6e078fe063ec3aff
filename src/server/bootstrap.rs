use crate::config::AppConfig;
use crate::server::{self, AppContext};
use anyhow::Result;
use std::sync::Arc;
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

/// Gateway lifecycle: init logging → load config → build context → serve →
/// drain on shutdown.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    let config = AppConfig::load(&args.config_path)?;
    tracing::info!(
        routing_url = %config.routing.url,
        endpoint_method = %config.endpoint.request_method,
        streaming_timeout = %humantime::format_duration(
            std::time::Duration::from_secs(config.federation.streaming_timeout)
        ),
        "config: loaded"
    );

    let ctx = AppContext::new(config)?;

    let admin_listen = args.admin_listen.clone();
    let admin_ctx = ctx.clone();
    tokio::spawn(async move {
        if let Err(e) = server::run_admin_server(&admin_listen, admin_ctx).await {
            tracing::error!("server: admin exited, error={}", e);
        }
    });

    let shutdown = Arc::new(Notify::new());
    let server_handle = tokio::spawn({
        let listen = args.listen.clone();
        let ctx = ctx.clone();
        let shutdown = shutdown.clone();
        async move { server::run_server(&listen, ctx, shutdown).await }
    });

    wait_for_signal().await;
    tracing::info!("server: shutdown signal received");
    shutdown.notify_waiters();

    if let Err(e) = server_handle.await? {
        tracing::error!("server: exited with error={}", e);
    }
    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
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

    std::mem::forget(guard);
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

/// Size the runtime from the container CPU limit rather than the host CPU
/// count: a pod capped at 4 cores on a 64-core node should not run 64
/// worker threads. Checks the `SEISGATE_WORKER_THREADS` override, then
/// cgroup v2, then falls back to host parallelism.
pub fn worker_threads() -> usize {
    if let Some(n) = std::env::var("SEISGATE_WORKER_THREADS")
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
    {
        return n.max(1);
    }
    if let Ok(cpu_max) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        if let Some(cores) = parse_cgroup_cpu_max(&cpu_max) {
            return cores.max(1);
        }
    }
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}

/// cgroup v2 `cpu.max` is `"<quota> <period>"` or `"max <period>"`.
fn parse_cgroup_cpu_max(content: &str) -> Option<usize> {
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    let period: i64 = parts.next()?.parse().ok()?;
    if quota == "max" || period <= 0 {
        return None;
    }
    let quota: i64 = quota.parse().ok()?;
    if quota <= 0 {
        return None;
    }
    Some((quota / period) as usize)
}
