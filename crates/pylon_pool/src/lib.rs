//! Execution substrate: Python worker processes and their host-side pool.
//!
//! Layering, bottom-up:
//! - `shim` materializes the embedded Python bridge to disk
//! - `interpreter` locates the Python executable
//! - `executor` owns exactly one worker child process and speaks the line
//!   protocol to it with wall-clock deadlines
//! - `pool` multiplexes a bounded set of executors across callers with
//!   FIFO borrow semantics and health-driven replacement
//! - `supervisor` boots the pool, runs the health sweep, and drains on
//!   shutdown
//! - `packages` is the boot-time pip interface for optional worker
//!   dependencies (the completion engine)

pub mod executor;
pub mod interpreter;
pub mod packages;
pub mod pool;
pub mod shim;
pub mod supervisor;

pub use executor::{Executor, ExecutorConfig, ExecutorError};
pub use pool::{Pool, PoolConfig, PoolError, PoolStats};
pub use supervisor::Supervisor;
