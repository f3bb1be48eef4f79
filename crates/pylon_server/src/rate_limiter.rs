//! Request rate limiting.
//!
//! Token bucket per user id (tokens refill linearly across the minute)
//! plus one global ceiling shared by everybody. Both are checked on every
//! request; either one rejecting yields 429 to the caller.

use dashmap::DashMap;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovRateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::warn;

type DirectLimiter = GovRateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Outcome of a rate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    LimitedUser,
    LimitedGlobal,
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

/// Per-user buckets plus a global ceiling.
pub struct RequestRateLimiter {
    per_user: DashMap<String, Arc<DirectLimiter>>,
    global: DirectLimiter,
    user_quota: Quota,
    per_minute: u32,
    global_per_minute: u32,
}

impl RequestRateLimiter {
    pub fn new(per_minute: u32, global_per_minute: u32) -> Self {
        let per_minute = per_minute.max(1);
        let global_per_minute = global_per_minute.max(1);
        let user_quota = Quota::per_minute(
            NonZeroU32::new(per_minute).expect("per-minute rate is clamped to >= 1"),
        );
        let global_quota = Quota::per_minute(
            NonZeroU32::new(global_per_minute).expect("global rate is clamped to >= 1"),
        );
        Self {
            per_user: DashMap::new(),
            global: GovRateLimiter::direct(global_quota),
            user_quota,
            per_minute,
            global_per_minute,
        }
    }

    /// Check (and consume) one token for `user_id`.
    pub fn check(&self, user_id: &str) -> RateDecision {
        if self.global.check().is_err() {
            warn!("global rate ceiling hit");
            return RateDecision::LimitedGlobal;
        }

        let limiter = self
            .per_user
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(GovRateLimiter::direct(self.user_quota)))
            .clone();

        match limiter.check() {
            Ok(_) => RateDecision::Allowed,
            Err(_) => {
                warn!(user_id = %user_id, "per-user rate limit exceeded");
                RateDecision::LimitedUser
            }
        }
    }

    /// Limits for the stats endpoint.
    pub fn info(&self) -> serde_json::Value {
        serde_json::json!({
            "per_user_per_minute": self.per_minute,
            "global_per_minute": self.global_per_minute,
            "active_buckets": self.per_user.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_user_limit() {
        let limiter = RequestRateLimiter::new(3, 1000);
        for _ in 0..3 {
            assert_eq!(limiter.check("alice"), RateDecision::Allowed);
        }
        assert_eq!(limiter.check("alice"), RateDecision::LimitedUser);
    }

    #[test]
    fn test_users_independent() {
        let limiter = RequestRateLimiter::new(1, 1000);
        assert_eq!(limiter.check("alice"), RateDecision::Allowed);
        assert_eq!(limiter.check("alice"), RateDecision::LimitedUser);
        assert_eq!(limiter.check("bob"), RateDecision::Allowed);
    }

    #[test]
    fn test_global_ceiling() {
        let limiter = RequestRateLimiter::new(100, 2);
        assert_eq!(limiter.check("a"), RateDecision::Allowed);
        assert_eq!(limiter.check("b"), RateDecision::Allowed);
        assert_eq!(limiter.check("c"), RateDecision::LimitedGlobal);
    }
}
