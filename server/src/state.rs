use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use sea_orm::DatabaseConnection;

use crate::analysis::AnalysisClient;
use crate::storage::Storage;

/// Simple per-IP fixed-window rate limiter
pub struct RateLimiter {
    /// Maps IP → (request count, window start)
    limits: DashMap<String, (u32, Instant)>,
    max_requests: u32,
    window_secs: u64,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window_secs: u64) -> Self {
        Self {
            limits: DashMap::new(),
            max_requests,
            window_secs,
        }
    }

    /// Returns true if the request is allowed, false if rate-limited.
    pub fn check(&self, ip: &str) -> bool {
        let now = Instant::now();
        let mut entry = self.limits.entry(ip.to_string()).or_insert((0, now));
        let (count, window_start) = entry.value_mut();
        if now.duration_since(*window_start).as_secs() >= self.window_secs {
            // Reset window
            *count = 1;
            *window_start = now;
            true
        } else if *count < self.max_requests {
            *count += 1;
            true
        } else {
            false
        }
    }

    /// Periodically clean up old entries (call from a background task)
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.limits.retain(|_, (_, start)| {
            now.duration_since(*start).as_secs() < self.window_secs * 2
        });
    }

    pub fn tracked(&self) -> usize {
        self.limits.len()
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    /// JWT signing secret
    pub jwt_secret: String,
    /// Lifetime of issued credentials
    pub token_ttl: chrono::Duration,
    /// Public disk for media, avatars, reports
    pub storage: Storage,
    /// External explain services
    pub analysis: AnalysisClient,
    /// Rate limiter for auth endpoints (login/register)
    pub auth_rate_limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(
        db: DatabaseConnection,
        jwt_secret: String,
        token_ttl_days: i64,
        storage: Storage,
        analysis: AnalysisClient,
        auth_requests_per_minute: u32,
    ) -> Self {
        Self {
            db,
            jwt_secret,
            token_ttl: chrono::Duration::days(token_ttl_days),
            storage,
            analysis,
            auth_rate_limiter: Arc::new(RateLimiter::new(auth_requests_per_minute, 60)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter_blocks_after_max() {
        let limiter = RateLimiter::new(3, 60);
        assert!(limiter.check("1.2.3.4"));
        assert!(limiter.check("1.2.3.4"));
        assert!(limiter.check("1.2.3.4"));
        assert!(!limiter.check("1.2.3.4"));
        // Separate window per IP
        assert!(limiter.check("5.6.7.8"));
    }

    #[test]
    fn test_rate_limiter_window_resets() {
        let limiter = RateLimiter::new(1, 0);
        assert!(limiter.check("ip"));
        // Zero-length window: every request opens a fresh one
        assert!(limiter.check("ip"));
    }

    #[test]
    fn test_cleanup_drops_stale_entries() {
        let limiter = RateLimiter::new(1, 0);
        limiter.check("ip");
        assert_eq!(limiter.tracked(), 1);
        limiter.cleanup();
        assert_eq!(limiter.tracked(), 0);
    }
}
