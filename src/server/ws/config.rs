//! Gateway configuration
//!
//! Reads the `gateway` section of the loaded config value into a typed
//! [`WsServerConfig`]. Environment variables override the file.

use serde::Deserialize;
use serde_json::Value;
use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::auth::challenge::ChallengeConfig;
use crate::config::ConfigError;
use crate::server::ratelimit::{
    RateLimitConfig, RateLimitSection, DEFAULT_MESSAGE_BURST, DEFAULT_MESSAGE_RATE,
};

use super::frames::{
    HANDSHAKE_TIMEOUT_MS, MAX_BUFFERED_BYTES, MAX_JSON_DEPTH, MAX_PAYLOAD_BYTES,
    TICK_INTERVAL_MS,
};

pub const DEFAULT_PORT: u16 = 18789;

/// `host:port` override for the listen address
pub const GATEWAY_ADDR_ENV: &str = "CLAWGATE_GATEWAY_ADDR";

/// Shared secret override for challenge authentication
pub const GATEWAY_SECRET_ENV: &str = "CLAWGATE_GATEWAY_SECRET";

#[derive(Debug, thiserror::Error)]
pub enum GatewayConfigError {
    #[error(
        "challenge auth is enabled but no secret is configured \
         (set gateway.auth.secret or {GATEWAY_SECRET_ENV})"
    )]
    MissingSecret,
    #[error("invalid gateway address {value:?}: {message}")]
    InvalidAddress { value: String, message: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Limits advertised to clients in `hello-ok`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WsPolicy {
    pub max_payload: usize,
    pub max_buffered_bytes: usize,
    pub tick_interval_ms: u64,
}

impl Default for WsPolicy {
    fn default() -> Self {
        Self {
            max_payload: MAX_PAYLOAD_BYTES,
            max_buffered_bytes: MAX_BUFFERED_BYTES,
            tick_interval_ms: TICK_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WsServerConfig {
    pub policy: WsPolicy,
    pub handshake_timeout: Duration,
    pub max_json_depth: usize,
    /// Empty list disables the origin check.
    pub allowed_origins: Vec<String>,
    pub trusted_proxies: Vec<String>,
    pub auth: ChallengeConfig,
    pub rate_limit: RateLimitConfig,
    pub message_rate: f64,
    pub message_burst: f64,
}

impl Default for WsServerConfig {
    fn default() -> Self {
        Self {
            policy: WsPolicy::default(),
            handshake_timeout: Duration::from_millis(HANDSHAKE_TIMEOUT_MS),
            max_json_depth: MAX_JSON_DEPTH,
            allowed_origins: Vec::new(),
            trusted_proxies: Vec::new(),
            auth: ChallengeConfig {
                max_age: Duration::from_millis(HANDSHAKE_TIMEOUT_MS),
                ..ChallengeConfig::default()
            },
            rate_limit: RateLimitConfig::default(),
            message_rate: DEFAULT_MESSAGE_RATE,
            message_burst: DEFAULT_MESSAGE_BURST,
        }
    }
}

/// `gateway` as written in the config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySection {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub handshake_timeout_ms: Option<u64>,
    pub challenge_max_age_ms: Option<u64>,
    pub max_payload_bytes: Option<usize>,
    pub max_buffered_bytes: Option<usize>,
    pub max_json_depth: Option<usize>,
    pub tick_interval_ms: Option<u64>,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default)]
    pub trusted_proxies: Vec<String>,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub rate_limit: RateLimitSection,
    #[serde(default)]
    pub message_rate: MessageRateSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSection {
    pub enable_challenge_auth: Option<bool>,
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageRateSection {
    pub rate: Option<f64>,
    pub burst: Option<f64>,
}

impl GatewaySection {
    /// Extract the `gateway` section from a loaded config value. A missing
    /// section yields defaults.
    pub fn from_value(cfg: &Value) -> Result<Self, GatewayConfigError> {
        match cfg.get("gateway") {
            None | Some(Value::Null) => Ok(Self::default()),
            Some(gateway) => serde_json::from_value(gateway.clone()).map_err(|e| {
                GatewayConfigError::Config(ConfigError::ValidationError {
                    path: ".gateway".to_string(),
                    message: e.to_string(),
                })
            }),
        }
    }
}

impl WsServerConfig {
    /// Build from a parsed section. `env_secret` takes precedence over the
    /// file secret.
    pub fn from_section(
        section: &GatewaySection,
        env_secret: Option<String>,
    ) -> Result<Self, GatewayConfigError> {
        let defaults = Self::default();
        let handshake_timeout = section
            .handshake_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.handshake_timeout);

        let enabled = section.auth.enable_challenge_auth.unwrap_or(true);
        let secret = env_secret
            .or_else(|| section.auth.secret.clone())
            .filter(|s| !s.trim().is_empty());
        if enabled && secret.is_none() {
            return Err(GatewayConfigError::MissingSecret);
        }

        Ok(Self {
            policy: WsPolicy {
                max_payload: section
                    .max_payload_bytes
                    .unwrap_or(defaults.policy.max_payload),
                max_buffered_bytes: section
                    .max_buffered_bytes
                    .unwrap_or(defaults.policy.max_buffered_bytes),
                tick_interval_ms: section
                    .tick_interval_ms
                    .unwrap_or(defaults.policy.tick_interval_ms),
            },
            handshake_timeout,
            max_json_depth: section.max_json_depth.unwrap_or(defaults.max_json_depth),
            allowed_origins: section.allowed_origins.clone(),
            trusted_proxies: section.trusted_proxies.clone(),
            auth: ChallengeConfig {
                enabled,
                secret,
                max_age: section
                    .challenge_max_age_ms
                    .map(Duration::from_millis)
                    .unwrap_or(handshake_timeout),
            },
            rate_limit: RateLimitConfig::from_section(&section.rate_limit),
            message_rate: section.message_rate.rate.unwrap_or(defaults.message_rate),
            message_burst: section.message_rate.burst.unwrap_or(defaults.message_burst),
        })
    }
}

/// Build the gateway config from a loaded config value plus environment.
pub fn build_ws_config_from_value(cfg: &Value) -> Result<WsServerConfig, GatewayConfigError> {
    let section = GatewaySection::from_value(cfg)?;
    WsServerConfig::from_section(&section, env::var(GATEWAY_SECRET_ENV).ok())
}

/// Resolve the listen address: `CLAWGATE_GATEWAY_ADDR`, then
/// `gateway.bind`/`gateway.port`, then `127.0.0.1:18789`.
pub fn resolve_bind_address(cfg: &Value) -> Result<SocketAddr, GatewayConfigError> {
    if let Ok(addr) = env::var(GATEWAY_ADDR_ENV) {
        return addr
            .parse()
            .map_err(|e: std::net::AddrParseError| GatewayConfigError::InvalidAddress {
                value: addr.clone(),
                message: e.to_string(),
            });
    }
    let section = GatewaySection::from_value(cfg)?;
    bind_address_from_section(&section)
}

fn bind_address_from_section(section: &GatewaySection) -> Result<SocketAddr, GatewayConfigError> {
    let port = section.port.unwrap_or(DEFAULT_PORT);
    let ip = match section.bind.as_deref().map(str::trim) {
        None | Some("") | Some("loopback") => IpAddr::V4(Ipv4Addr::LOCALHOST),
        Some("all") | Some("lan") => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        Some(other) => other.parse().map_err(|e: std::net::AddrParseError| {
            GatewayConfigError::InvalidAddress {
                value: other.to_string(),
                message: e.to_string(),
            }
        })?,
    };
    Ok(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn section(value: Value) -> GatewaySection {
        GatewaySection::from_value(&json!({ "gateway": value })).unwrap()
    }

    #[test]
    fn test_defaults_with_secret() {
        let config =
            WsServerConfig::from_section(&GatewaySection::default(), Some("s".to_string()))
                .unwrap();
        assert_eq!(config.policy.max_payload, 512 * 1024);
        assert_eq!(config.policy.max_buffered_bytes, 1536 * 1024);
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.auth.max_age, Duration::from_secs(10));
        assert!(config.auth.enabled);
        assert!(config.allowed_origins.is_empty());
        assert_eq!(config.max_json_depth, 32);
    }

    #[test]
    fn test_missing_secret_is_an_error() {
        let result = WsServerConfig::from_section(&GatewaySection::default(), None);
        assert!(matches!(result, Err(GatewayConfigError::MissingSecret)));

        let blank = section(json!({ "auth": { "secret": "   " } }));
        assert!(matches!(
            WsServerConfig::from_section(&blank, None),
            Err(GatewayConfigError::MissingSecret)
        ));
    }

    #[test]
    fn test_disabled_challenge_auth_needs_no_secret() {
        let s = section(json!({ "auth": { "enableChallengeAuth": false } }));
        let config = WsServerConfig::from_section(&s, None).unwrap();
        assert!(!config.auth.enabled);
        assert!(config.auth.secret.is_none());
    }

    #[test]
    fn test_env_secret_overrides_file() {
        let s = section(json!({ "auth": { "secret": "from-file" } }));
        let config = WsServerConfig::from_section(&s, Some("from-env".to_string())).unwrap();
        assert_eq!(config.auth.secret.as_deref(), Some("from-env"));
    }

    #[test]
    fn test_section_overrides() {
        let s = section(json!({
            "handshakeTimeoutMs": 2500,
            "maxPayloadBytes": 1024,
            "maxBufferedBytes": 4096,
            "maxJsonDepth": 8,
            "allowedOrigins": ["https://console.example.com"],
            "trustedProxies": ["10.0.0.1"],
            "auth": { "secret": "s" },
            "rateLimit": { "maxAttempts": 3, "windowMs": 1000 },
            "messageRate": { "rate": 5.0, "burst": 10.0 }
        }));
        let config = WsServerConfig::from_section(&s, None).unwrap();
        assert_eq!(config.handshake_timeout, Duration::from_millis(2500));
        assert_eq!(config.auth.max_age, Duration::from_millis(2500));
        assert_eq!(config.policy.max_payload, 1024);
        assert_eq!(config.policy.max_buffered_bytes, 4096);
        assert_eq!(config.max_json_depth, 8);
        assert_eq!(config.allowed_origins, vec!["https://console.example.com"]);
        assert_eq!(config.trusted_proxies, vec!["10.0.0.1"]);
        assert_eq!(config.rate_limit.max_attempts, 3);
        assert_eq!(config.rate_limit.window, Duration::from_secs(1));
        assert_eq!(config.message_rate, 5.0);
        assert_eq!(config.message_burst, 10.0);
    }

    #[test]
    fn test_challenge_max_age_independent_of_timeout() {
        let s = section(json!({
            "handshakeTimeoutMs": 5000,
            "challengeMaxAgeMs": 2000,
            "auth": { "secret": "s" }
        }));
        let config = WsServerConfig::from_section(&s, None).unwrap();
        assert_eq!(config.auth.max_age, Duration::from_secs(2));
    }

    #[test]
    fn test_malformed_section_reported() {
        let result = GatewaySection::from_value(&json!({ "gateway": { "port": "nope" } }));
        assert!(matches!(result, Err(GatewayConfigError::Config(_))));
    }

    #[test]
    fn test_bind_address_resolution() {
        let addr = bind_address_from_section(&GatewaySection::default()).unwrap();
        assert_eq!(addr, "127.0.0.1:18789".parse().unwrap());

        let s = section(json!({ "bind": "lan", "port": 9000 }));
        assert_eq!(
            bind_address_from_section(&s).unwrap(),
            "0.0.0.0:9000".parse().unwrap()
        );

        let s = section(json!({ "bind": "::1" }));
        assert_eq!(
            bind_address_from_section(&s).unwrap(),
            "[::1]:18789".parse().unwrap()
        );

        let s = section(json!({ "bind": "not-an-ip" }));
        assert!(matches!(
            bind_address_from_section(&s),
            Err(GatewayConfigError::InvalidAddress { .. })
        ));
    }
}
