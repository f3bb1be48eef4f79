//! Canonical runtime configuration, read once at process start.

use crate::defaults;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Process-wide configuration. Every knob has a working default; the server
/// binary overlays environment variables on top.
#[derive(Debug, Clone)]
pub struct PylonConfig {
    /// HTTP bind address.
    pub bind_addr: String,
    /// Number of Executors at steady state.
    pub pool_size: usize,
    /// Adaptive sizing bounds.
    pub pool_min: usize,
    pub pool_max: usize,
    /// Python executable; auto-detected when None.
    pub interpreter_path: Option<PathBuf>,
    /// Wall-clock deadline per worker request.
    pub request_timeout: Duration,
    /// Pool borrow wait.
    pub borrow_timeout: Duration,
    /// Health-sweep tick interval.
    pub health_interval: Duration,
    /// Startup ping deadline after spawn.
    pub startup_timeout: Duration,
    /// Health probe deadline.
    pub probe_timeout: Duration,
    /// Worker address-space cap (MiB).
    pub memory_mb: u64,
    /// Worker CPU cap (seconds).
    pub cpu_seconds: u64,
    /// Maximum request code size (bytes).
    pub code_bytes: usize,
    /// Captured stdout cap (bytes).
    pub output_bytes: usize,
    /// Per-user request budget per minute.
    pub rate_per_minute: u32,
    /// Global request ceiling per minute.
    pub rate_global_per_minute: u32,
    /// HMAC signing key for the script store; derived when None.
    pub sign_key: Option<String>,
    /// Script store root directory.
    pub store_root: PathBuf,
    /// Audit log path (JSONL, append-only).
    pub audit_path: PathBuf,
    /// Admin credential; ADMIN mode is unavailable when None.
    pub admin_key: Option<String>,
    /// Accepted API keys. Empty means API-key auth is disabled and only
    /// session tokens are accepted.
    pub api_keys: Vec<String>,
}

impl Default for PylonConfig {
    fn default() -> Self {
        let home = pylon_home();
        Self {
            bind_addr: defaults::DEFAULT_BIND_ADDR.to_string(),
            pool_size: defaults::DEFAULT_POOL_SIZE,
            pool_min: defaults::DEFAULT_POOL_MIN,
            pool_max: defaults::DEFAULT_POOL_MAX,
            interpreter_path: None,
            request_timeout: defaults::DEFAULT_REQUEST_TIMEOUT,
            borrow_timeout: defaults::DEFAULT_BORROW_TIMEOUT,
            health_interval: defaults::DEFAULT_HEALTH_INTERVAL,
            startup_timeout: defaults::DEFAULT_STARTUP_TIMEOUT,
            probe_timeout: defaults::DEFAULT_PROBE_TIMEOUT,
            memory_mb: defaults::DEFAULT_MEMORY_MB,
            cpu_seconds: defaults::DEFAULT_CPU_SECONDS,
            code_bytes: defaults::DEFAULT_CODE_BYTES,
            output_bytes: defaults::DEFAULT_OUTPUT_BYTES,
            rate_per_minute: defaults::DEFAULT_RATE_PER_MINUTE,
            rate_global_per_minute: defaults::DEFAULT_RATE_GLOBAL_PER_MINUTE,
            sign_key: None,
            store_root: home.join("scripts"),
            audit_path: home.join("audit.jsonl"),
            admin_key: None,
            api_keys: Vec::new(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("pool.size must be at least 1")]
    PoolSizeZero,
    #[error("pool bounds invalid: min {min} > max {max}")]
    PoolBoundsInverted { min: usize, max: usize },
    #[error("limits.cpu_seconds must be at least 1")]
    CpuCapZero,
    #[error("limits.code_bytes must be at least 1")]
    CodeCapZero,
}

impl PylonConfig {
    /// Validate invariants and repair the ones that are safe to repair.
    ///
    /// The wall-clock request timeout must be strictly greater than the
    /// in-worker CPU cap; when it is not, it is raised and a note returned
    /// for the caller to log.
    pub fn validate(&mut self) -> Result<Vec<String>, ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::PoolSizeZero);
        }
        if self.pool_min > self.pool_max {
            return Err(ConfigError::PoolBoundsInverted {
                min: self.pool_min,
                max: self.pool_max,
            });
        }
        if self.cpu_seconds == 0 {
            return Err(ConfigError::CpuCapZero);
        }
        if self.code_bytes == 0 {
            return Err(ConfigError::CodeCapZero);
        }

        let mut notes = Vec::new();
        let cpu_cap = Duration::from_secs(self.cpu_seconds);
        if self.request_timeout <= cpu_cap {
            let raised = cpu_cap + Duration::from_secs(5);
            notes.push(format!(
                "request.timeout {}s <= limits.cpu_seconds {}s; raised to {}s",
                self.request_timeout.as_secs(),
                self.cpu_seconds,
                raised.as_secs()
            ));
            self.request_timeout = raised;
        }
        if self.pool_size < self.pool_min || self.pool_size > self.pool_max {
            notes.push(format!(
                "pool.size {} outside [{}, {}]; adaptive sizing will clamp",
                self.pool_size, self.pool_min, self.pool_max
            ));
        }
        Ok(notes)
    }
}

/// The Pylon home directory: `~/.pylon`, overridable with `PYLON_HOME`.
pub fn pylon_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("PYLON_HOME") {
        return PathBuf::from(override_path);
    }
    dirs_home()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".pylon")
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}
