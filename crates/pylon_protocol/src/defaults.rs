//! Canonical default values shared across the host and the bridge.

use std::time::Duration;

/// HTTP bind address.
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8700";

/// Steady-state pool cardinality.
pub const DEFAULT_POOL_SIZE: usize = 3;
/// Adaptive sizing lower bound.
pub const DEFAULT_POOL_MIN: usize = 2;
/// Adaptive sizing upper bound.
pub const DEFAULT_POOL_MAX: usize = 10;

/// Wall-clock deadline for one worker response. Strictly greater than
/// `DEFAULT_CPU_SECONDS` so the in-process CPU cap always fires first.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// Pool borrow wait.
pub const DEFAULT_BORROW_TIMEOUT: Duration = Duration::from_secs(30);
/// Supervisor health-sweep tick.
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(30);
/// Deadline for the startup ping after spawn.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
/// Deadline for a health-sweep probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
/// Grace period between the shutdown line and a forced kill.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Worker address-space cap in MiB.
pub const DEFAULT_MEMORY_MB: u64 = 512;
/// Worker CPU cap in seconds.
pub const DEFAULT_CPU_SECONDS: u64 = 60;
/// Maximum accepted code size in bytes (1 MiB).
pub const DEFAULT_CODE_BYTES: usize = 1024 * 1024;
/// Captured stdout cap in bytes (10 MiB).
pub const DEFAULT_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Per-user request budget per minute.
pub const DEFAULT_RATE_PER_MINUTE: u32 = 100;
/// Global request ceiling per minute.
pub const DEFAULT_RATE_GLOBAL_PER_MINUTE: u32 = 1000;

/// Bounded retries for a failed worker spawn before the slot is declared
/// down.
pub const DEFAULT_SPAWN_RETRIES: u32 = 3;

/// Marker appended when captured stdout exceeds the output cap.
pub const OUTPUT_TRUNCATED_MARKER: &str = "\n...[output truncated]";
