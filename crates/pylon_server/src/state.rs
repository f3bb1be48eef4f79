//! Shared application state and per-request context.

use crate::audit::AuditLog;
use crate::metrics::MetricsEngine;
use crate::rate_limiter::RequestRateLimiter;
use anyhow::{Context, Result};
use pylon_pool::{Pool, Supervisor};
use pylon_protocol::config::pylon_home;
use pylon_protocol::PylonConfig;
use pylon_security::{
    derive_install_key, CredentialChecker, Gatekeeper, Identity, SessionResolver, SigningKey,
};
use pylon_store::ScriptStore;
use std::sync::Arc;
use tracing::warn;

/// Request context attached by the auth middleware.
#[derive(Clone)]
pub struct RequestContext {
    pub identity: Identity,
    pub client_ip: String,
}

struct StateInner {
    config: PylonConfig,
    supervisor: Supervisor,
    store: ScriptStore,
    gatekeeper: Gatekeeper,
    credentials: CredentialChecker,
    audit: AuditLog,
    limiter: RequestRateLimiter,
    metrics: MetricsEngine,
}

/// The service instance: one per process, explicit dependencies, no
/// global singletons.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<StateInner>,
}

impl AppState {
    /// Wire every component together and boot the pool.
    pub async fn initialize(
        config: PylonConfig,
        sessions: Option<Arc<dyn SessionResolver>>,
    ) -> Result<Self> {
        let signing_key = resolve_signing_key(&config);

        let supervisor = Supervisor::start(&config).await?;
        let store = ScriptStore::open(&config.store_root, signing_key)
            .context("Failed to open script store")?;
        let audit = AuditLog::open(&config.audit_path).context("Failed to open audit log")?;
        let credentials =
            CredentialChecker::new(&config.api_keys, config.admin_key.as_deref(), sessions);
        let limiter =
            RequestRateLimiter::new(config.rate_per_minute, config.rate_global_per_minute);

        Ok(Self {
            inner: Arc::new(StateInner {
                supervisor,
                store,
                gatekeeper: Gatekeeper::new(),
                credentials,
                audit,
                limiter,
                metrics: MetricsEngine::new(),
                config,
            }),
        })
    }

    pub fn config(&self) -> &PylonConfig {
        &self.inner.config
    }

    pub fn pool(&self) -> &Pool {
        self.inner.supervisor.pool()
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.inner.supervisor
    }

    pub fn store(&self) -> &ScriptStore {
        &self.inner.store
    }

    pub fn gatekeeper(&self) -> &Gatekeeper {
        &self.inner.gatekeeper
    }

    pub fn credentials(&self) -> &CredentialChecker {
        &self.inner.credentials
    }

    pub fn audit(&self) -> &AuditLog {
        &self.inner.audit
    }

    pub fn limiter(&self) -> &RequestRateLimiter {
        &self.inner.limiter
    }

    pub fn metrics(&self) -> &MetricsEngine {
        &self.inner.metrics
    }
}

/// Use the configured signing key, or fall back to one derived from the
/// installation path and hostname. The derived key keeps development
/// installs working but is reproducible by anyone on the machine, so it
/// is logged as insecure.
fn resolve_signing_key(config: &PylonConfig) -> SigningKey {
    match &config.sign_key {
        Some(key) => SigningKey::new(key.as_bytes().to_vec()),
        None => {
            warn!(
                "sign.key not configured; deriving a per-installation key \
                (not secure for production)"
            );
            derive_install_key(&pylon_home(), &hostname())
        }
    }
}

fn hostname() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.is_empty() {
            return name;
        }
    }
    std::fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
