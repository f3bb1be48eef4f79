//! Pylon server binary.
//!
//! Usage:
//!     pylon-server --bind 127.0.0.1:8700 --pool-size 3 --api-keys secret1
//!
//! Every flag can also come from a PYLON_* environment variable.

use anyhow::{Context, Result};
use clap::Parser;
use pylon_logging::{init_logging, LogConfig};
use pylon_protocol::PylonConfig;
use pylon_server::{build_router, AppState};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "pylon-server", about = "Out-of-process Python execution service")]
struct Args {
    /// HTTP bind address
    #[arg(long, env = "PYLON_BIND", default_value = pylon_protocol::defaults::DEFAULT_BIND_ADDR)]
    bind: String,

    /// Number of worker processes at steady state
    #[arg(long, env = "PYLON_POOL_SIZE", default_value_t = pylon_protocol::defaults::DEFAULT_POOL_SIZE)]
    pool_size: usize,

    /// Adaptive sizing lower bound
    #[arg(long, env = "PYLON_POOL_MIN", default_value_t = pylon_protocol::defaults::DEFAULT_POOL_MIN)]
    pool_min: usize,

    /// Adaptive sizing upper bound
    #[arg(long, env = "PYLON_POOL_MAX", default_value_t = pylon_protocol::defaults::DEFAULT_POOL_MAX)]
    pool_max: usize,

    /// Python executable (auto-detected if not set)
    #[arg(long, env = "PYLON_PYTHON")]
    python: Option<PathBuf>,

    /// Wall-clock deadline per request, seconds
    #[arg(long, env = "PYLON_REQUEST_TIMEOUT", default_value_t = 60)]
    request_timeout_secs: u64,

    /// Pool borrow wait, seconds
    #[arg(long, env = "PYLON_BORROW_TIMEOUT", default_value_t = 30)]
    borrow_timeout_secs: u64,

    /// Health sweep interval, seconds
    #[arg(long, env = "PYLON_HEALTH_INTERVAL", default_value_t = 30)]
    health_interval_secs: u64,

    /// Worker address-space cap, MiB
    #[arg(long, env = "PYLON_MEMORY_MB", default_value_t = pylon_protocol::defaults::DEFAULT_MEMORY_MB)]
    memory_mb: u64,

    /// Worker CPU cap per request, seconds
    #[arg(long, env = "PYLON_CPU_SECONDS", default_value_t = pylon_protocol::defaults::DEFAULT_CPU_SECONDS)]
    cpu_seconds: u64,

    /// Maximum request code size, bytes
    #[arg(long, env = "PYLON_CODE_BYTES", default_value_t = pylon_protocol::defaults::DEFAULT_CODE_BYTES)]
    code_bytes: usize,

    /// Captured stdout cap, bytes
    #[arg(long, env = "PYLON_OUTPUT_BYTES", default_value_t = pylon_protocol::defaults::DEFAULT_OUTPUT_BYTES)]
    output_bytes: usize,

    /// Per-user requests per minute
    #[arg(long, env = "PYLON_RATE_PER_MINUTE", default_value_t = pylon_protocol::defaults::DEFAULT_RATE_PER_MINUTE)]
    rate_per_minute: u32,

    /// Global requests per minute
    #[arg(long, env = "PYLON_RATE_GLOBAL", default_value_t = pylon_protocol::defaults::DEFAULT_RATE_GLOBAL_PER_MINUTE)]
    rate_global_per_minute: u32,

    /// HMAC signing key for stored scripts (derived per install if unset)
    #[arg(long, env = "PYLON_SIGN_KEY")]
    sign_key: Option<String>,

    /// Admin credential enabling ADMIN security mode
    #[arg(long, env = "PYLON_ADMIN_KEY")]
    admin_key: Option<String>,

    /// Accepted API keys, comma separated
    #[arg(long, env = "PYLON_API_KEYS", value_delimiter = ',')]
    api_keys: Vec<String>,

    /// Script store root (defaults to ~/.pylon/scripts)
    #[arg(long, env = "PYLON_STORE_ROOT")]
    store_root: Option<PathBuf>,

    /// Audit log path (defaults to ~/.pylon/audit.jsonl)
    #[arg(long, env = "PYLON_AUDIT_PATH")]
    audit_path: Option<PathBuf>,

    /// Mirror the full log filter to stderr
    #[arg(long, short)]
    verbose: bool,
}

impl Args {
    fn into_config(self) -> PylonConfig {
        let mut config = PylonConfig {
            bind_addr: self.bind,
            pool_size: self.pool_size,
            pool_min: self.pool_min,
            pool_max: self.pool_max,
            interpreter_path: self.python,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            borrow_timeout: Duration::from_secs(self.borrow_timeout_secs),
            health_interval: Duration::from_secs(self.health_interval_secs),
            memory_mb: self.memory_mb,
            cpu_seconds: self.cpu_seconds,
            code_bytes: self.code_bytes,
            output_bytes: self.output_bytes,
            rate_per_minute: self.rate_per_minute,
            rate_global_per_minute: self.rate_global_per_minute,
            sign_key: self.sign_key,
            admin_key: self.admin_key,
            api_keys: self.api_keys.into_iter().filter(|k| !k.is_empty()).collect(),
            ..PylonConfig::default()
        };
        if let Some(store_root) = self.store_root {
            config.store_root = store_root;
        }
        if let Some(audit_path) = self.audit_path {
            config.audit_path = audit_path;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let verbose = args.verbose;
    init_logging(LogConfig {
        app_name: "pylon-server",
        verbose,
    })?;

    let mut config = args.into_config();
    for note in config.validate().context("Invalid configuration")? {
        warn!("{}", note);
    }
    if config.api_keys.is_empty() && config.admin_key.is_none() {
        warn!(
            "No API keys or admin key configured; only host session tokens \
            will authenticate"
        );
    }

    info!("Starting pylon-server");
    info!("  Bind: {}", config.bind_addr);
    info!("  Pool: {} (bounds {}..{})", config.pool_size, config.pool_min, config.pool_max);
    info!("  Store: {}", config.store_root.display());

    let bind_addr: SocketAddr = config
        .bind_addr
        .parse()
        .with_context(|| format!("Invalid bind address: {}", config.bind_addr))?;

    let state = AppState::initialize(config, None).await?;

    // Per-minute metric snapshots feed the historical ring and the alert
    // rules.
    let snapshot_state = state.clone();
    let snapshot_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let stats = snapshot_state.pool().stats();
            snapshot_state.metrics().take_snapshot(stats);
        }
    });

    let router = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    info!("pylon-server listening on {}", bind_addr);

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("HTTP server failed")?;

    // Reverse construction order: stop tickers, then drain the pool.
    snapshot_task.abort();
    state.supervisor().shutdown().await;
    info!("pylon-server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
