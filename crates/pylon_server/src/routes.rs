//! Router assembly.
//!
//! Everything under `/api/v1` requires authentication; `/health` is the
//! only public route. Security headers and request tracing wrap the whole
//! tree.

use crate::handlers::{auth, exec, scripts, stats};
use crate::headers::security_headers;
use crate::state::AppState;
use axum::routing::{get, post};
use axum::{middleware, Router};
use tower_http::trace::TraceLayer;

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/exec", post(exec::exec))
        .route("/eval", post(exec::eval))
        .route("/call-module", post(exec::call_module))
        .route("/call-script", post(exec::call_script))
        .route("/check-syntax", post(exec::check_syntax))
        .route("/completions", post(exec::completions))
        .route("/pool-stats", get(stats::pool_stats))
        .route("/metrics", get(stats::metrics_aggregate))
        .route("/metrics/historical", get(stats::metrics_history))
        .route("/metrics/alerts", get(stats::metrics_alerts))
        .route("/scripts", get(scripts::list_scripts).post(scripts::save_script))
        .route(
            "/scripts/:name",
            get(scripts::get_script).delete(scripts::delete_script),
        )
        .route("/scripts/:name/rename", post(scripts::rename_script))
        .route("/scripts/:name/move", post(scripts::move_script))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    Router::new()
        .route("/health", get(stats::health))
        .nest("/api/v1", api)
        .layer(middleware::from_fn(security_headers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
