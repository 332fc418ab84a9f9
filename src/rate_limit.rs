use std::net::SocketAddr;

use chrono::Utc;
use dashmap::DashMap;

use crate::config::RateLimitConfig;
use crate::error::RateLimitError;
use crate::metrics;

/// Fixed counting window for one client key.
#[derive(Debug, Clone, Copy)]
struct Window {
    window_start: i64,
    count: u32,
}

/// In-memory fixed-window rate limiter for the login endpoint.
///
/// State is per-process and sharded by key, so checks on unrelated keys
/// never contend; each entry mutates under its own shard lock. Not
/// cluster-safe: replicas each enforce their own window.
pub struct LoginRateLimiter {
    windows: DashMap<String, Window>,
    max_requests: u32,
    window_seconds: i64,
}

impl LoginRateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            windows: DashMap::new(),
            max_requests: config.max_requests,
            window_seconds: config.window_seconds,
        }
    }

    /// Admit or reject one request for `client_key`.
    pub fn admit(&self, client_key: &str) -> Result<(), RateLimitError> {
        self.admit_at(client_key, Utc::now().timestamp())
    }

    fn admit_at(&self, client_key: &str, now: i64) -> Result<(), RateLimitError> {
        let mut window = self
            .windows
            .entry(client_key.to_string())
            .or_insert(Window {
                window_start: now,
                count: 0,
            });

        if now - window.window_start >= self.window_seconds {
            window.window_start = now;
            window.count = 0;
        }
        window.count += 1;

        if window.count > self.max_requests {
            let retry_after = self.window_seconds - (now - window.window_start);
            drop(window);
            metrics::RATE_LIMIT_REJECTED_TOTAL.inc();
            tracing::warn!(client_key = %client_key, "login rate limit exceeded");
            return Err(RateLimitError::WindowExceeded {
                retry_after_seconds: retry_after.max(1),
            });
        }

        Ok(())
    }
}

/// Resolve the rate-limit key for a request: first `X-Forwarded-For` value
/// when present, otherwise the remote address.
///
/// The forwarded header is client-supplied and spoofable behind an untrusted
/// proxy; preserved as-is rather than hardened, since the intended trust
/// boundary is the fronting proxy.
pub fn resolve_client_key(forwarded_for: Option<&str>, remote: SocketAddr) -> String {
    if let Some(xff) = forwarded_for {
        if let Some(first) = xff.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    remote.ip().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_requests: u32, window_seconds: i64) -> LoginRateLimiter {
        LoginRateLimiter::new(&RateLimitConfig {
            max_requests,
            window_seconds,
        })
    }

    #[test]
    fn allows_up_to_max_then_rejects_in_window() {
        let limiter = limiter(10, 60);
        let t0 = 1_000_000;

        for i in 0..10 {
            assert!(limiter.admit_at("1.2.3.4", t0 + i).is_ok(), "request {} should pass", i);
        }
        match limiter.admit_at("1.2.3.4", t0 + 30) {
            Err(RateLimitError::WindowExceeded { retry_after_seconds }) => {
                assert!(retry_after_seconds > 0 && retry_after_seconds <= 60);
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn window_resets_after_expiry() {
        let limiter = limiter(10, 60);
        let t0 = 1_000_000;

        for _ in 0..11 {
            let _ = limiter.admit_at("1.2.3.4", t0);
        }
        assert!(limiter.admit_at("1.2.3.4", t0 + 60).is_ok());
    }

    #[test]
    fn keys_are_independent() {
        let limiter = limiter(1, 60);
        let t0 = 1_000_000;

        assert!(limiter.admit_at("1.1.1.1", t0).is_ok());
        assert!(limiter.admit_at("1.1.1.1", t0).is_err());
        assert!(limiter.admit_at("2.2.2.2", t0).is_ok());
    }

    #[test]
    fn client_key_prefers_first_forwarded_for_value() {
        let remote: SocketAddr = "10.0.0.1:40000".parse().unwrap();
        assert_eq!(
            resolve_client_key(Some("203.0.113.7, 10.0.0.2"), remote),
            "203.0.113.7"
        );
        assert_eq!(resolve_client_key(None, remote), "10.0.0.1");
        assert_eq!(resolve_client_key(Some("  "), remote), "10.0.0.1");
    }
}
