//! HTTP surface for the Pylon execution service.
//!
//! Fronts the pool with authentication, validation, rate limiting,
//! auditing, metrics, and the script store. Route handlers translate HTTP
//! bodies into worker commands and map every failure onto the shared
//! error taxonomy.

pub mod audit;
pub mod error;
pub mod handlers;
pub mod headers;
pub mod metrics;
pub mod rate_limiter;
pub mod routes;
pub mod state;

pub use routes::build_router;
pub use state::AppState;
