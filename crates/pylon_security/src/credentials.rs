//! Credential checking for the HTTP surface.
//!
//! A caller authenticates with either a host-platform session token
//! (resolved to a user id by an external collaborator) or an API key. A
//! separate admin key upgrades the request to ADMIN mode. All secret
//! comparisons go through SHA-256 digests compared in constant time, so
//! neither key length nor matching-prefix length is observable.

use crate::signing::sha256_hex;
use pylon_protocol::SecurityMode;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// Resolves host-platform session tokens to user ids. Implemented by the
/// embedding host; Pylon only consumes it.
pub trait SessionResolver: Send + Sync {
    fn resolve(&self, token: &str) -> Option<String>;
}

/// The authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub mode: SecurityMode,
}

/// Checks API keys, session tokens, and the admin key.
pub struct CredentialChecker {
    api_key_digests: Vec<[u8; 32]>,
    admin_key_digest: Option<[u8; 32]>,
    sessions: Option<Arc<dyn SessionResolver>>,
}

impl CredentialChecker {
    pub fn new(
        api_keys: &[String],
        admin_key: Option<&str>,
        sessions: Option<Arc<dyn SessionResolver>>,
    ) -> Self {
        Self {
            api_key_digests: api_keys.iter().map(|k| digest(k.as_bytes())).collect(),
            admin_key_digest: admin_key.map(|k| digest(k.as_bytes())),
            sessions,
        }
    }

    /// Resolve the caller's identity, session token first. Returns None when
    /// no presented credential is valid.
    pub fn authenticate(
        &self,
        session_token: Option<&str>,
        api_key: Option<&str>,
        admin_key: Option<&str>,
    ) -> Option<Identity> {
        let mode = if self.is_admin(admin_key) {
            SecurityMode::Admin
        } else {
            SecurityMode::Restricted
        };

        if let (Some(token), Some(resolver)) = (session_token, self.sessions.as_ref()) {
            if let Some(user_id) = resolver.resolve(token) {
                return Some(Identity { user_id, mode });
            }
        }

        if let Some(key) = api_key {
            let presented = digest(key.as_bytes());
            for known in &self.api_key_digests {
                if bool::from(known.ct_eq(&presented)) {
                    // Stable pseudonymous id so audit entries correlate
                    // without recording the key itself.
                    let user_id = format!("key-{}", &sha256_hex(key.as_bytes())[..12]);
                    return Some(Identity { user_id, mode });
                }
            }
        }

        None
    }

    /// Constant-time admin key check.
    pub fn is_admin(&self, presented: Option<&str>) -> bool {
        match (presented, self.admin_key_digest.as_ref()) {
            (Some(presented), Some(known)) => {
                bool::from(known.ct_eq(&digest(presented.as_bytes())))
            }
            _ => false,
        }
    }
}

fn digest(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSessions;

    impl SessionResolver for FixedSessions {
        fn resolve(&self, token: &str) -> Option<String> {
            (token == "valid-session").then(|| "alice".to_string())
        }
    }

    fn checker() -> CredentialChecker {
        CredentialChecker::new(
            &["api-key-1".to_string(), "api-key-2".to_string()],
            Some("admin-secret"),
            Some(Arc::new(FixedSessions)),
        )
    }

    #[test]
    fn test_session_token_resolves() {
        let identity = checker()
            .authenticate(Some("valid-session"), None, None)
            .unwrap();
        assert_eq!(identity.user_id, "alice");
        assert_eq!(identity.mode, SecurityMode::Restricted);
    }

    #[test]
    fn test_api_key_accepted() {
        let identity = checker()
            .authenticate(None, Some("api-key-2"), None)
            .unwrap();
        assert!(identity.user_id.starts_with("key-"));
    }

    #[test]
    fn test_invalid_credentials_refused() {
        assert!(checker().authenticate(None, Some("wrong"), None).is_none());
        assert!(checker().authenticate(Some("stale"), None, None).is_none());
        assert!(checker().authenticate(None, None, None).is_none());
    }

    #[test]
    fn test_admin_key_upgrades_mode() {
        let identity = checker()
            .authenticate(Some("valid-session"), None, Some("admin-secret"))
            .unwrap();
        assert_eq!(identity.mode, SecurityMode::Admin);
    }

    #[test]
    fn test_wrong_admin_key_stays_restricted() {
        let identity = checker()
            .authenticate(Some("valid-session"), None, Some("not-it"))
            .unwrap();
        assert_eq!(identity.mode, SecurityMode::Restricted);
    }

    #[test]
    fn test_admin_disabled_without_configured_key() {
        let checker = CredentialChecker::new(&["k".to_string()], None, None);
        assert!(!checker.is_admin(Some("anything")));
    }

    #[test]
    fn test_admin_key_alone_is_not_identity() {
        // The admin key gates mode; it does not authenticate by itself.
        assert!(checker()
            .authenticate(None, None, Some("admin-secret"))
            .is_none());
    }
}
