//! Supervisor: boots the execution substrate and keeps it healthy.
//!
//! Owns the pool plus the periodic health-sweep task. Shutdown runs in
//! reverse construction order (ticker first, then the pool) and is
//! idempotent.

use crate::executor::ExecutorConfig;
use crate::interpreter::detect_interpreter;
use crate::packages::{ensure_completion_engine, PipPackageManager};
use crate::pool::{Pool, PoolConfig};
use crate::shim::materialize_bridge_shim;
use anyhow::{Context, Result};
use pylon_protocol::{defaults, PylonConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

pub struct Supervisor {
    pool: Pool,
    sweep_task: tokio::task::JoinHandle<()>,
    shut_down: Arc<AtomicBool>,
}

impl Supervisor {
    /// Resolve the interpreter, materialize the bridge shim, start the
    /// pool, check optional worker dependencies, and launch the health
    /// sweep ticker.
    pub async fn start(config: &PylonConfig) -> Result<Self> {
        let interpreter = detect_interpreter(config.interpreter_path.as_deref())
            .context("Interpreter detection failed")?;
        let shim_path = materialize_bridge_shim().context("Bridge shim materialization failed")?;

        let packages = PipPackageManager::new(interpreter.clone());
        let completion_ready = ensure_completion_engine(&packages);
        debug!("Completion engine available: {}", completion_ready);

        let pool_config = PoolConfig {
            size: config.pool_size,
            min: config.pool_min,
            max: config.pool_max,
            borrow_timeout: config.borrow_timeout,
            request_timeout: config.request_timeout,
            probe_timeout: config.probe_timeout,
            spawn_retries: defaults::DEFAULT_SPAWN_RETRIES,
            executor: ExecutorConfig {
                interpreter_path: interpreter,
                shim_path,
                memory_mb: config.memory_mb,
                cpu_seconds: config.cpu_seconds,
                output_bytes: config.output_bytes,
                startup_timeout: config.startup_timeout,
                shutdown_grace: defaults::DEFAULT_SHUTDOWN_GRACE,
            },
        };

        let pool = Pool::start(pool_config).await?;

        let sweep_pool = pool.clone();
        let interval = config.health_interval;
        let sweep_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The immediate first tick would re-probe freshly started
            // workers; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                sweep_pool.health_sweep().await;
            }
        });

        info!("Supervisor started (health sweep every {:?})", interval);

        Ok(Self {
            pool,
            sweep_task,
            shut_down: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Reverse-order teardown: stop the sweep ticker, then drain and close
    /// the pool. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sweep_task.abort();
        self.pool.shutdown().await;
        info!("Supervisor shutdown complete");
    }
}
