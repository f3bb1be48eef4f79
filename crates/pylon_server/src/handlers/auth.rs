//! Authentication middleware.
//!
//! Resolves the caller's identity from a session token (`Authorization:
//! Bearer`) or an `X-Api-Key` header, and derives the security mode from
//! the optional `X-Admin-Key` header. Unauthenticated requests are
//! refused here, before any handler runs.

use crate::error::ApiError;
use crate::state::{AppState, RequestContext};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use std::net::SocketAddr;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const ADMIN_KEY_HEADER: &str = "x-admin-key";

pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let headers = request.headers();
    let session = bearer_token(headers);
    let api_key = header_str(headers, API_KEY_HEADER);
    let admin_key = header_str(headers, ADMIN_KEY_HEADER);

    let identity = state
        .credentials()
        .authenticate(session, api_key, admin_key)
        .ok_or_else(ApiError::unauthorized)?;

    let client_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    request
        .extensions_mut()
        .insert(RequestContext { identity, client_ip });
    Ok(next.run(request).await)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
}
