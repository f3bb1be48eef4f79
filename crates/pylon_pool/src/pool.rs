//! Pool: multiplexes a bounded set of Executors across concurrent callers.
//!
//! Invariants:
//! - steady-state cardinality equals the configured size; replacement
//!   restores it after a failure
//! - only AVAILABLE executors can be borrowed, and a borrowed executor is
//!   exclusively owned by its lease until returned
//! - borrow waiters are served FIFO (the tokio semaphore is fair)
//! - return happens on every exit path: the lease's Drop hands the
//!   executor back through a channel, so panics and cancelled requests
//!   cannot leak a worker
//!
//! The semaphore's permit count always equals the idle queue length; the
//! two are only changed together.

use crate::executor::{Executor, ExecutorConfig, ExecutorError};
use pylon_protocol::{ErrorKind, WorkerRequest, WorkerResponse};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

/// Backoff base between spawn retries.
const SPAWN_RETRY_BACKOFF: Duration = Duration::from_millis(500);
/// How long shutdown waits for in-flight requests before closing workers.
const DRAIN_GRACE: Duration = Duration::from_secs(10);
/// Borrow waits longer than this count toward growing the pool.
const GROW_WAIT_THRESHOLD: Duration = Duration::from_millis(1000);
/// Utilisation bounds for adaptive sizing.
const GROW_UTILISATION: f64 = 0.90;
const SHRINK_UTILISATION: f64 = 0.30;
/// Window for borrow-wait samples.
const WAIT_SAMPLE_WINDOW: Duration = Duration::from_secs(60);

/// Pool configuration, plain data.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub size: usize,
    pub min: usize,
    pub max: usize,
    pub borrow_timeout: Duration,
    pub request_timeout: Duration,
    pub probe_timeout: Duration,
    pub spawn_retries: u32,
    pub executor: ExecutorConfig,
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no executor available within {0:?}")]
    Exhausted(Duration),
    #[error("pool is shutting down")]
    ShuttingDown,
}

impl PoolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PoolError::Exhausted(_) => ErrorKind::PoolExhausted,
            PoolError::ShuttingDown => ErrorKind::WorkerUnavailable,
        }
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub available: usize,
    pub in_use: usize,
    pub healthy: usize,
    pub replacing: usize,
    pub waiters: usize,
}

struct PoolShared {
    config: PoolConfig,
    idle: Mutex<VecDeque<Executor>>,
    available: Semaphore,
    total: AtomicUsize,
    in_use: AtomicUsize,
    replacing: AtomicUsize,
    waiters: AtomicUsize,
    next_slot_id: AtomicU32,
    next_generation: AtomicU64,
    shutting_down: AtomicBool,
    returns_tx: mpsc::UnboundedSender<Executor>,
    wait_samples: Mutex<VecDeque<(Instant, Duration)>>,
}

/// The pool handle. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<PoolShared>,
}

impl Pool {
    /// Spawn the configured number of executors and start the return
    /// processor. Fails only when not a single worker could be started; a
    /// slot whose spawn retries are exhausted is declared down and the
    /// pool runs with reduced cardinality.
    pub async fn start(config: PoolConfig) -> anyhow::Result<Self> {
        let (returns_tx, returns_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(PoolShared {
            available: Semaphore::new(0),
            idle: Mutex::new(VecDeque::with_capacity(config.size)),
            total: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
            replacing: AtomicUsize::new(0),
            waiters: AtomicUsize::new(0),
            next_slot_id: AtomicU32::new(0),
            next_generation: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            returns_tx,
            wait_samples: Mutex::new(VecDeque::new()),
            config,
        });

        for _ in 0..shared.config.size {
            let slot_id = shared.next_slot_id.fetch_add(1, Ordering::SeqCst);
            match spawn_with_retries(&shared, slot_id).await {
                Some(executor) => {
                    shared.total.fetch_add(1, Ordering::SeqCst);
                    push_idle(&shared, executor);
                }
                None => {
                    error!("Pool slot {} failed to start; continuing without it", slot_id);
                }
            }
        }

        let started = shared.total.load(Ordering::SeqCst);
        if started == 0 {
            anyhow::bail!("No worker could be started; check the interpreter and shim");
        }
        info!("Pool started with {}/{} executors", started, shared.config.size);

        tokio::spawn(run_returns(Arc::clone(&shared), returns_rx));

        Ok(Self { shared })
    }

    /// Borrow an executor, waiting at most the configured borrow timeout.
    /// Waiters are served in arrival order.
    pub async fn borrow(&self) -> Result<ExecutorLease, PoolError> {
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            return Err(PoolError::ShuttingDown);
        }

        let wait_started = Instant::now();
        self.shared.waiters.fetch_add(1, Ordering::SeqCst);
        let acquired = tokio::time::timeout(
            self.shared.config.borrow_timeout,
            self.shared.available.acquire(),
        )
        .await;
        self.shared.waiters.fetch_sub(1, Ordering::SeqCst);

        let permit = match acquired {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::ShuttingDown),
            Err(_) => return Err(PoolError::Exhausted(self.shared.config.borrow_timeout)),
        };
        permit.forget();

        self.record_wait(wait_started.elapsed());

        let executor = {
            let mut idle = lock_idle(&self.shared);
            idle.pop_front()
        };
        let executor = match executor {
            Some(executor) => executor,
            // A forgotten permit always has a matching queued executor;
            // reaching here means the bookkeeping broke. Fail the borrow
            // rather than the process.
            None => {
                error!("Pool permit had no matching idle executor");
                return Err(PoolError::Exhausted(self.shared.config.borrow_timeout));
            }
        };

        self.shared.in_use.fetch_add(1, Ordering::SeqCst);
        Ok(ExecutorLease {
            executor: Some(executor),
            shared: Arc::clone(&self.shared),
        })
    }

    /// The wall-clock deadline leases should use for one request.
    pub fn request_timeout(&self) -> Duration {
        self.shared.config.request_timeout
    }

    pub fn stats(&self) -> PoolStats {
        let total = self.shared.total.load(Ordering::SeqCst);
        let replacing = self.shared.replacing.load(Ordering::SeqCst);
        PoolStats {
            total,
            available: self.shared.available.available_permits(),
            in_use: self.shared.in_use.load(Ordering::SeqCst),
            healthy: total.saturating_sub(replacing),
            replacing,
            waiters: self.shared.waiters.load(Ordering::SeqCst),
        }
    }

    /// One health-sweep pass over every currently idle executor.
    ///
    /// Each probed executor is first taken out of the idle queue (permit
    /// and all), so a borrower can never race the probe. Probe passes go
    /// straight back; failures move to replacement.
    pub async fn health_sweep(&self) {
        let mut probed = Vec::new();
        loop {
            match self.shared.available.try_acquire() {
                Ok(permit) => {
                    permit.forget();
                    let executor = lock_idle(&self.shared).pop_front();
                    match executor {
                        Some(executor) => probed.push(executor),
                        None => break,
                    }
                }
                Err(_) => break,
            }
        }

        for mut executor in probed {
            let id = executor.id();
            let generation = executor.generation();
            let healthy = executor.is_healthy();
            let probe = executor.ping(self.shared.config.probe_timeout).await;
            match probe {
                Ok(()) if healthy => {
                    push_idle(&self.shared, executor);
                }
                Ok(()) => {
                    info!(
                        "Executor {}#{} ping ok but health {} below threshold; replacing",
                        id,
                        generation,
                        executor.health_score()
                    );
                    self.replace(executor);
                }
                Err(e) => {
                    warn!("Executor {}#{} failed probe: {}; replacing", id, generation, e);
                    self.replace(executor);
                }
            }
        }

        self.adapt().await;
    }

    /// Adaptive sizing: grow under sustained wait pressure, shrink when
    /// mostly idle. Base correctness does not depend on this running.
    async fn adapt(&self) {
        let total = self.shared.total.load(Ordering::SeqCst);
        if total == 0 {
            // All slots down; replacement owns recovery.
            return;
        }
        let in_use = self.shared.in_use.load(Ordering::SeqCst);
        let utilisation = in_use as f64 / total as f64;
        let avg_wait = self.average_wait();

        if utilisation > GROW_UTILISATION
            && avg_wait > GROW_WAIT_THRESHOLD
            && total < self.shared.config.max
        {
            let slot_id = self.shared.next_slot_id.fetch_add(1, Ordering::SeqCst);
            info!(
                "Pool growing to {} (utilisation {:.0}%, avg wait {:?})",
                total + 1,
                utilisation * 100.0,
                avg_wait
            );
            if let Some(executor) = spawn_with_retries(&self.shared, slot_id).await {
                self.shared.total.fetch_add(1, Ordering::SeqCst);
                push_idle(&self.shared, executor);
            }
        } else if utilisation < SHRINK_UTILISATION && total > self.shared.config.min {
            if let Ok(permit) = self.shared.available.try_acquire() {
                permit.forget();
                let executor = lock_idle(&self.shared).pop_front();
                if let Some(executor) = executor {
                    info!("Pool shrinking to {} (utilisation {:.0}%)", total - 1, utilisation * 100.0);
                    self.shared.total.fetch_sub(1, Ordering::SeqCst);
                    tokio::spawn(executor.close());
                }
            }
        }
    }

    fn replace(&self, executor: Executor) {
        self.shared.replacing.fetch_add(1, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let slot_id = executor.id();
            executor.close().await;
            replace_slot(shared, slot_id).await;
        });
    }

    fn record_wait(&self, waited: Duration) {
        let mut samples = self
            .shared
            .wait_samples
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        samples.push_back((now, waited));
        while let Some((at, _)) = samples.front() {
            if now.duration_since(*at) > WAIT_SAMPLE_WINDOW {
                samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn average_wait(&self) -> Duration {
        let samples = self
            .shared
            .wait_samples
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if samples.is_empty() {
            return Duration::ZERO;
        }
        let sum: Duration = samples.iter().map(|(_, d)| *d).sum();
        sum / samples.len() as u32
    }

    /// Stop accepting borrows, drain in-flight requests, close every
    /// worker. Idempotent. No child process survives this call.
    pub async fn shutdown(&self) {
        if self.shared.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Pool shutting down");
        self.shared.available.close();

        let drain_started = Instant::now();
        while self.shared.in_use.load(Ordering::SeqCst) > 0 {
            if drain_started.elapsed() > DRAIN_GRACE {
                warn!(
                    "Pool drain grace expired with {} executors still in use",
                    self.shared.in_use.load(Ordering::SeqCst)
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let drained: Vec<Executor> = {
            let mut idle = lock_idle(&self.shared);
            idle.drain(..).collect()
        };
        for executor in drained {
            self.shared.total.fetch_sub(1, Ordering::SeqCst);
            executor.close().await;
        }
        // Late returns are closed by the return processor; child handles
        // are spawned kill-on-drop as the final backstop.
        info!("Pool shutdown complete");
    }
}

/// A scoped loan of one executor. Dropping the lease returns the executor
/// to the pool on every exit path; the pool discards and replaces it when
/// it comes back unhealthy.
pub struct ExecutorLease {
    executor: Option<Executor>,
    shared: Arc<PoolShared>,
}

impl ExecutorLease {
    /// Dispatch one request on the leased worker.
    pub async fn execute(
        &mut self,
        request: &WorkerRequest,
        deadline: Duration,
    ) -> Result<WorkerResponse, ExecutorError> {
        let executor = self
            .executor
            .as_mut()
            .expect("lease holds an executor until dropped");
        executor.execute(request, deadline).await
    }

    pub fn executor_id(&self) -> u32 {
        self.executor
            .as_ref()
            .map(Executor::id)
            .unwrap_or_default()
    }
}

impl Drop for ExecutorLease {
    fn drop(&mut self) {
        if let Some(executor) = self.executor.take() {
            self.shared.in_use.fetch_sub(1, Ordering::SeqCst);
            // The return processor owns requeue-or-replace. If it is gone
            // the process is exiting and kill-on-drop reaps the child.
            let _ = self.shared.returns_tx.send(executor);
        }
    }
}

fn lock_idle(shared: &PoolShared) -> std::sync::MutexGuard<'_, VecDeque<Executor>> {
    shared
        .idle
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn push_idle(shared: &Arc<PoolShared>, executor: Executor) {
    lock_idle(shared).push_back(executor);
    shared.available.add_permits(1);
}

/// Process returned leases: requeue healthy executors, replace the rest.
async fn run_returns(shared: Arc<PoolShared>, mut rx: mpsc::UnboundedReceiver<Executor>) {
    while let Some(executor) = rx.recv().await {
        if shared.shutting_down.load(Ordering::SeqCst) {
            shared.total.fetch_sub(1, Ordering::SeqCst);
            executor.close().await;
            continue;
        }
        if executor.is_healthy() {
            push_idle(&shared, executor);
        } else {
            let slot_id = executor.id();
            debug!(
                "Executor {} returned unhealthy (score {}); replacing",
                slot_id,
                executor.health_score()
            );
            shared.replacing.fetch_add(1, Ordering::SeqCst);
            let shared_clone = Arc::clone(&shared);
            tokio::spawn(async move {
                executor.close().await;
                replace_slot(shared_clone, slot_id).await;
            });
        }
    }
}

/// Spawn a replacement into an existing slot. On success the newcomer
/// joins the idle queue; after bounded retries the slot is declared down
/// and cardinality shrinks.
async fn replace_slot(shared: Arc<PoolShared>, slot_id: u32) {
    let result = spawn_with_retries(&shared, slot_id).await;
    shared.replacing.fetch_sub(1, Ordering::SeqCst);
    match result {
        Some(executor) => {
            info!("Executor slot {} replaced (generation {})", slot_id, executor.generation());
            push_idle(&shared, executor);
        }
        None => {
            shared.total.fetch_sub(1, Ordering::SeqCst);
            error!(
                "Executor slot {} permanently down after {} spawn attempts",
                slot_id, shared.config.spawn_retries
            );
        }
    }
}

async fn spawn_with_retries(shared: &Arc<PoolShared>, slot_id: u32) -> Option<Executor> {
    for attempt in 1..=shared.config.spawn_retries.max(1) {
        let generation = shared.next_generation.fetch_add(1, Ordering::SeqCst);
        match Executor::start(slot_id, generation, &shared.config.executor).await {
            Ok(executor) => return Some(executor),
            Err(e) => {
                warn!(
                    "Spawn attempt {}/{} for slot {} failed: {}",
                    attempt, shared.config.spawn_retries, slot_id, e
                );
                if attempt < shared.config.spawn_retries {
                    tokio::time::sleep(SPAWN_RETRY_BACKOFF * attempt).await;
                }
            }
        }
    }
    None
}
