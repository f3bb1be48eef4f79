//! Executor: host-side owner of one Python worker process.
//!
//! Presents the worker as a request/response operation with wall-clock
//! deadlines. The executor never tries to repair its worker: any transport
//! failure (deadline, EOF, desync) is terminal and the pool replaces the
//! pair wholesale.
//!
//! Two timeouts guard an execution. The bridge's CPU cap fires inside the
//! interpreter and leaves the worker alive; the executor's wall-clock
//! deadline fires when the worker stops answering entirely. The wall clock
//! is configured strictly larger than the CPU cap.

use chrono::{DateTime, Utc};
use pylon_protocol::{
    decode_response, encode_request, ErrorKind, FrameError, WorkerRequest, WorkerResponse,
};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

/// Health credit for a completed execution.
const SUCCESS_CREDIT: i32 = 5;
/// Health penalty when the bridge reports a CPU timeout.
const TIMEOUT_PENALTY: i32 = 20;
/// Health penalty for transport failures (deadline, EOF, broken pipe).
const IO_PENALTY: i32 = 30;
/// Health penalty when the worker ran out of memory.
const MEMORY_PENALTY: i32 = 50;
/// Health penalty for any other reported error.
const ERROR_PENALTY: i32 = 10;
/// Below this score the executor marks itself unhealthy.
const UNHEALTHY_THRESHOLD: i32 = 30;

/// Plain spawn-time configuration for one executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub interpreter_path: PathBuf,
    pub shim_path: PathBuf,
    pub memory_mb: u64,
    pub cpu_seconds: u64,
    pub output_bytes: usize,
    pub startup_timeout: Duration,
    pub shutdown_grace: Duration,
}

/// Errors from the executor's transport layer. Bridge-reported failures are
/// not errors here; they come back as `WorkerResponse` values.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("worker did not answer within {0:?}")]
    Deadline(Duration),
    #[error("worker stream closed")]
    StreamClosed,
    #[error("worker i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol desync: expected response id {expected}, got {got}")]
    Desync { expected: String, got: String },
    #[error("malformed response line: {0}")]
    Frame(#[from] FrameError),
    #[error("worker failed startup ping: {0}")]
    Startup(String),
}

impl ExecutorError {
    /// Map to the caller-facing taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecutorError::Deadline(_) => ErrorKind::Timeout,
            _ => ErrorKind::WorkerUnavailable,
        }
    }
}

/// One worker child plus its bookkeeping. Identity is (id, generation):
/// the id names the pool slot, the generation counts replacements.
pub struct Executor {
    id: u32,
    generation: u64,
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    stderr_task: tokio::task::JoinHandle<()>,
    health_score: i32,
    created_at: DateTime<Utc>,
    last_used_at: DateTime<Utc>,
    execution_count: u64,
    failure_count: u64,
    shutdown_grace: Duration,
}

impl Executor {
    /// Spawn a worker and require a ping answer within the startup
    /// deadline. A worker that cannot ping is killed and the error
    /// propagated; the pool decides whether to retry.
    pub async fn start(id: u32, generation: u64, config: &ExecutorConfig) -> Result<Self, ExecutorError> {
        let mut child = Command::new(&config.interpreter_path)
            .arg(&config.shim_path)
            .env("PYLON_MEMORY_MB", config.memory_mb.to_string())
            .env("PYLON_CPU_SECONDS", config.cpu_seconds.to_string())
            .env("PYLON_OUTPUT_BYTES", config.output_bytes.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take().ok_or(ExecutorError::StreamClosed)?;
        let stdout = child.stdout.take().ok_or(ExecutorError::StreamClosed)?;
        let stderr = child.stderr.take().ok_or(ExecutorError::StreamClosed)?;

        let pid = child.id().unwrap_or_default();
        let stderr_task = tokio::spawn(drain_stderr(id, generation, stderr));

        let now = Utc::now();
        let mut executor = Self {
            id,
            generation,
            child,
            stdin,
            stdout: BufReader::new(stdout),
            stderr_task,
            health_score: 100,
            created_at: now,
            last_used_at: now,
            execution_count: 0,
            failure_count: 0,
            shutdown_grace: config.shutdown_grace,
        };

        match executor.ping(config.startup_timeout).await {
            Ok(()) => {
                info!(
                    "Executor {}#{} ready (pid={})",
                    id, generation, pid
                );
                Ok(executor)
            }
            Err(e) => {
                executor.kill().await;
                Err(ExecutorError::Startup(e.to_string()))
            }
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn health_score(&self) -> i32 {
        self.health_score
    }

    pub fn is_healthy(&self) -> bool {
        self.health_score >= UNHEALTHY_THRESHOLD
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_used_at(&self) -> DateTime<Utc> {
        self.last_used_at
    }

    pub fn execution_count(&self) -> u64 {
        self.execution_count
    }

    pub fn failure_count(&self) -> u64 {
        self.failure_count
    }

    /// Send one request and wait for its response under `deadline`.
    ///
    /// Serialized by construction: callers hold the executor exclusively
    /// (borrowed from the pool), so exactly one request is ever in flight.
    /// A transport error pins the health score below the unhealthy
    /// threshold; the worker is done for.
    pub async fn execute(
        &mut self,
        request: &WorkerRequest,
        deadline: Duration,
    ) -> Result<WorkerResponse, ExecutorError> {
        self.last_used_at = Utc::now();
        self.execution_count += 1;

        let result = tokio::time::timeout(deadline, self.exchange(request)).await;
        let response = match result {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.fail_transport();
                return Err(e);
            }
            Err(_) => {
                self.fail_transport();
                return Err(ExecutorError::Deadline(deadline));
            }
        };

        self.score_response(&response);
        Ok(response)
    }

    /// Liveness probe. Issued on idle executors only, so it cannot race a
    /// borrower.
    pub async fn ping(&mut self, deadline: Duration) -> Result<(), ExecutorError> {
        let request = WorkerRequest::ping();
        let result = tokio::time::timeout(deadline, self.exchange(&request)).await;
        match result {
            Ok(Ok(response)) if response.success => Ok(()),
            Ok(Ok(response)) => Err(ExecutorError::Startup(
                response.error.unwrap_or_else(|| "ping refused".to_string()),
            )),
            Ok(Err(e)) => {
                self.fail_transport();
                Err(e)
            }
            Err(_) => {
                self.fail_transport();
                Err(ExecutorError::Deadline(deadline))
            }
        }
    }

    async fn exchange(&mut self, request: &WorkerRequest) -> Result<WorkerResponse, ExecutorError> {
        let line = encode_request(request)?;
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;

        let mut response_line = String::new();
        let read = self.stdout.read_line(&mut response_line).await?;
        if read == 0 {
            return Err(ExecutorError::StreamClosed);
        }
        let response = decode_response(&response_line)?;
        if response.id != request.id {
            return Err(ExecutorError::Desync {
                expected: request.id.clone(),
                got: response.id,
            });
        }
        Ok(response)
    }

    fn score_response(&mut self, response: &WorkerResponse) {
        if response.success {
            self.health_score = (self.health_score + SUCCESS_CREDIT).min(100);
            return;
        }
        self.failure_count += 1;
        let penalty = match response.kind {
            Some(ErrorKind::Timeout) => TIMEOUT_PENALTY,
            Some(ErrorKind::ResourceExceeded) => MEMORY_PENALTY,
            _ => ERROR_PENALTY,
        };
        self.health_score = (self.health_score - penalty).max(0);
        if !self.is_healthy() {
            warn!(
                "Executor {}#{} health {} below threshold",
                self.id, self.generation, self.health_score
            );
        }
    }

    fn fail_transport(&mut self) {
        self.failure_count += 1;
        // Transport failures are terminal regardless of prior score.
        self.health_score = (self.health_score - IO_PENALTY).max(0).min(UNHEALTHY_THRESHOLD - 1);
    }

    /// Orderly close: shutdown line, bounded grace, then kill. Idempotent
    /// against an already-dead child.
    pub async fn close(mut self) {
        let request = WorkerRequest::shutdown();
        if let Ok(line) = encode_request(&request) {
            let _ = self.stdin.write_all(line.as_bytes()).await;
            let _ = self.stdin.flush().await;
        }

        match tokio::time::timeout(self.shutdown_grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(
                    "Executor {}#{} exited with {} after shutdown",
                    self.id, self.generation, status
                );
            }
            _ => {
                debug!(
                    "Executor {}#{} did not exit within grace; killing",
                    self.id, self.generation
                );
                self.kill().await;
            }
        }
        self.stderr_task.abort();
    }

    async fn kill(&mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

/// Forward worker stderr lines to the host log. Stderr is diagnostics
/// only and never parsed as protocol.
async fn drain_stderr(id: u32, generation: u64, stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("worker {}#{} stderr: {}", id, generation, line);
    }
}
