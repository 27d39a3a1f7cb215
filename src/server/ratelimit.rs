//! Rate limiting
//!
//! Two limiters live here:
//! - [`ConnectRateLimiter`]: fixed-window counter per client IP, consulted
//!   once per accepted WebSocket before any challenge is issued.
//! - [`MessageRateLimiter`]: token bucket per connection, consulted for every
//!   inbound request after the handshake.

use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Default connect attempts allowed per window
pub const DEFAULT_MAX_ATTEMPTS: u32 = 20;

/// Default connect window
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Default cleanup interval (evict stale windows)
const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Default per-connection message rate (messages per second)
pub const DEFAULT_MESSAGE_RATE: f64 = 60.0;

/// Default per-connection message burst
pub const DEFAULT_MESSAGE_BURST: f64 = 120.0;

/// Rate limit errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("rate limit exceeded")]
    LimitExceeded { retry_after_secs: u64 },
}

/// Connect-attempt limiter configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Whether rate limiting is enabled
    pub enabled: bool,
    /// Attempts allowed per window
    pub max_attempts: u32,
    /// Window length
    pub window: Duration,
    /// Whether to exempt loopback addresses
    pub exempt_loopback: bool,
    /// Exempt IPs
    pub exempt_ips: Vec<IpAddr>,
    /// How often stale windows are evicted
    pub cleanup_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            enabled: true,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            window: DEFAULT_WINDOW,
            exempt_loopback: true,
            exempt_ips: Vec::new(),
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

impl RateLimitConfig {
    pub fn builder() -> RateLimitConfigBuilder {
        RateLimitConfigBuilder::default()
    }

    /// Check if an IP is exempt from rate limiting
    pub fn is_exempt(&self, ip: &IpAddr) -> bool {
        if self.exempt_loopback && crate::auth::is_loopback_addr(*ip) {
            return true;
        }
        self.exempt_ips.contains(ip)
    }

    /// Apply the `gateway.rateLimit` config section over the defaults.
    pub fn from_section(section: &RateLimitSection) -> Self {
        let defaults = Self::default();
        RateLimitConfig {
            enabled: section.enabled.unwrap_or(defaults.enabled),
            max_attempts: section.max_attempts.unwrap_or(defaults.max_attempts),
            window: section
                .window_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.window),
            exempt_loopback: section.exempt_loopback.unwrap_or(defaults.exempt_loopback),
            exempt_ips: section
                .exempt_ips
                .iter()
                .filter_map(|ip| ip.trim().parse().ok())
                .collect(),
            cleanup_interval: section
                .cleanup_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.cleanup_interval),
        }
    }
}

/// `gateway.rateLimit` as written in the config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSection {
    pub enabled: Option<bool>,
    pub max_attempts: Option<u32>,
    pub window_ms: Option<u64>,
    pub exempt_loopback: Option<bool>,
    #[serde(default)]
    pub exempt_ips: Vec<String>,
    pub cleanup_interval_ms: Option<u64>,
}

/// Builder for RateLimitConfig
#[derive(Default)]
pub struct RateLimitConfigBuilder {
    config: RateLimitConfig,
}

impl RateLimitConfigBuilder {
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.config.window = window;
        self
    }

    pub fn exempt_loopback(mut self, exempt: bool) -> Self {
        self.config.exempt_loopback = exempt;
        self
    }

    pub fn exempt_ips(mut self, ips: Vec<IpAddr>) -> Self {
        self.config.exempt_ips = ips;
        self
    }

    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.config.cleanup_interval = interval;
        self
    }

    pub fn build(self) -> RateLimitConfig {
        self.config
    }
}

/// Attempt count and window start for one key
#[derive(Debug, Clone, Copy)]
struct WindowBucket {
    count: u32,
    window_start: Instant,
}

/// Fixed-window connect limiter keyed by client IP.
#[derive(Clone)]
pub struct ConnectRateLimiter {
    buckets: Arc<RwLock<HashMap<IpAddr, WindowBucket>>>,
    config: Arc<RateLimitConfig>,
    last_cleanup: Arc<RwLock<Instant>>,
}

impl ConnectRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        ConnectRateLimiter {
            buckets: Arc::new(RwLock::new(HashMap::new())),
            config: Arc::new(config),
            last_cleanup: Arc::new(RwLock::new(Instant::now())),
        }
    }

    /// Record an attempt for `ip` and decide whether it is allowed.
    pub fn check(&self, ip: IpAddr) -> Result<(), RateLimitError> {
        self.check_at(ip, Instant::now())
    }

    /// [`check`](Self::check) against an explicit clock reading.
    pub fn check_at(&self, ip: IpAddr, now: Instant) -> Result<(), RateLimitError> {
        if !self.config.enabled || self.config.is_exempt(&ip) {
            return Ok(());
        }

        self.maybe_cleanup(now);

        let window = self.config.window;
        let mut buckets = self.buckets.write();
        let bucket = buckets.entry(ip).or_insert(WindowBucket {
            count: 0,
            window_start: now,
        });

        if now.saturating_duration_since(bucket.window_start) >= window {
            bucket.count = 0;
            bucket.window_start = now;
        }

        if bucket.count >= self.config.max_attempts {
            let remaining = window.saturating_sub(now.saturating_duration_since(bucket.window_start));
            return Err(RateLimitError::LimitExceeded {
                retry_after_secs: remaining.as_secs().max(1),
            });
        }

        bucket.count += 1;
        Ok(())
    }

    fn maybe_cleanup(&self, now: Instant) {
        let mut last_cleanup = self.last_cleanup.write();
        if now.saturating_duration_since(*last_cleanup) < self.config.cleanup_interval {
            return;
        }
        *last_cleanup = now;
        drop(last_cleanup);

        let window = self.config.window;
        let mut buckets = self.buckets.write();
        buckets.retain(|_, b| now.saturating_duration_since(b.window_start) < window);

        debug!(
            target: "gateway",
            remaining = buckets.len(),
            "connect rate limiter cleanup"
        );
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            tracked_keys: self.buckets.read().len(),
            config_enabled: self.config.enabled,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

/// Rate limiter statistics
#[derive(Debug, Clone)]
pub struct RateLimiterStats {
    pub tracked_keys: usize,
    pub config_enabled: bool,
}

/// Token bucket state for a single connection
#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    rate: f64,
    max_tokens: f64,
}

impl TokenBucket {
    fn new(rate: f64, burst: f64) -> Self {
        TokenBucket {
            tokens: burst,
            last_refill: Instant::now(),
            rate,
            max_tokens: burst,
        }
    }

    fn try_consume(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.max_tokens);
        self.last_refill = now;
    }
}

/// Per-connection inbound message limiter.
#[derive(Debug)]
pub struct MessageRateLimiter {
    bucket: parking_lot::Mutex<TokenBucket>,
}

impl MessageRateLimiter {
    pub fn new(rate: f64, burst: f64) -> Self {
        Self {
            bucket: parking_lot::Mutex::new(TokenBucket::new(rate.max(0.0), burst.max(1.0))),
        }
    }

    pub fn try_acquire(&self) -> bool {
        self.bucket.lock().try_consume()
    }
}

impl Default for MessageRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MESSAGE_RATE, DEFAULT_MESSAGE_BURST)
    }
}
