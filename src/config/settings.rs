use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Configuration settings for the edge shield
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Public listener that fronts the protected application
    pub server: ServerConfig,
    /// Admin/stats listener
    pub admin: AdminConfig,
    /// Gating pipeline switches
    pub gate: GateConfig,
    /// Redis configuration
    pub redis: RedisConfig,
    /// Rate limiting configuration
    pub rate_limit: RateLimitConfig,
    /// Blacklist seeding
    pub blacklist: BlacklistConfig,
    /// Attack signature scanning
    pub waf: WafConfig,
    /// Session cookie handling
    pub session: SessionConfig,
    /// The protected application
    pub upstream: UpstreamConfig,
    /// Audit channel sizing
    pub audit: AuditConfig,
    /// Periodic health snapshots
    pub monitor: MonitorConfig,
    /// Prometheus exporter
    pub metrics: MetricsConfig,
}

/// Server configuration settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host address to bind the server to
    pub host: String,
    /// Port number to listen on
    pub port: u16,
    /// Take the client IP from the first `X-Forwarded-For` hop
    pub trust_forwarded_for: bool,
    /// Overall request timeout in seconds
    pub request_timeout_seconds: u64,
    /// Largest request body buffered by the gateway; bigger ones get 413
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            trust_forwarded_for: false,
            request_timeout_seconds: 30,
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Admin API listener
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 3001,
        }
    }
}

/// Switches consumed by the gating pipeline
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Enable proof-of-work challenge gating
    pub pow: bool,
    /// Enable the rate-limit step on allowed requests
    pub rate_limit: bool,
    /// Path prefix of the challenge entry point
    pub challenge_path: String,
    /// Budget for each collaborator call, in milliseconds
    pub lookup_timeout_ms: u64,
}

impl GateConfig {
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    /// Reject challenge paths that would leave every request ungated
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        let path = self.challenge_path.trim_end_matches('/');
        if path.is_empty() || !path.starts_with('/') {
            return Err(config::ConfigError::Message(format!(
                "gate.challenge_path must be an absolute path below '/', got '{}'",
                self.challenge_path
            )));
        }
        Ok(())
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            pow: true,
            rate_limit: true,
            challenge_path: "/pow".to_string(),
            lookup_timeout_ms: 50,
        }
    }
}

/// Redis configuration settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis connection URL; in-memory collaborators are used when unset
    pub url: Option<String>,
}

/// Rate limiting configuration settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Maximum number of requests allowed per period
    pub max_requests: u32,
    /// Time period in seconds for rate limiting
    pub period_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            period_seconds: 60,
        }
    }
}

/// Blacklist seeding applied at startup
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BlacklistConfig {
    /// Addresses banned on every start
    pub ips: Vec<IpAddr>,
    /// Ban lifetime in seconds, 0 keeps entries forever
    pub expiration_seconds: u64,
}

/// Attack signature scanning settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WafConfig {
    /// Include the built-in signature set
    pub builtin_rules: bool,
    /// Extra rules as a JSON array
    pub rules_path: Option<String>,
    /// Body bytes inspected by the scanner
    pub max_body_bytes: usize,
}

impl Default for WafConfig {
    fn default() -> Self {
        Self {
            builtin_rules: true,
            rules_path: None,
            max_body_bytes: 1024 * 1024,
        }
    }
}

/// Session cookie settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub cookie_name: String,
    /// Sessions idle longer than this are dropped
    pub idle_timeout_seconds: u64,
    /// Upper bound on live sessions
    pub max_sessions: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: "shield_sid".to_string(),
            idle_timeout_seconds: 24 * 60 * 60,
            max_sessions: 100_000,
        }
    }
}

/// The protected application
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL requests are forwarded to
    pub url: String,
    pub timeout_seconds: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8080".to_string(),
            timeout_seconds: 30,
        }
    }
}

/// Audit channel settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Events buffered before new ones are dropped
    pub channel_capacity: usize,
    /// Records kept per stream by the audit stores
    pub max_records: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            max_records: 1000,
        }
    }
}

/// Health monitor settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 5 * 60,
        }
    }
}

/// Prometheus exporter settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Address for the exporter, e.g. `0.0.0.0:9000`
    pub listen: Option<SocketAddr>,
}

impl Settings {
    /// Load configuration from `shield.{toml,json,...}` and `SHIELD__*` environment variables
    pub fn load() -> Result<Self, config::ConfigError> {
        // Load .env file if it exists
        dotenv::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("shield").required(false))
            .add_source(
                config::Environment::with_prefix("SHIELD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Self = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check values that deserialize fine but cannot work
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        self.gate.validate()
    }

    /// Address of the public listener
    pub fn listen_addr(&self) -> Result<SocketAddr, config::ConfigError> {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .map_err(|e| config::ConfigError::Message(format!("invalid server address: {}", e)))
    }

    /// Address of the admin listener
    pub fn admin_addr(&self) -> Result<SocketAddr, config::ConfigError> {
        format!("{}:{}", self.admin.host, self.admin.port)
            .parse()
            .map_err(|e| config::ConfigError::Message(format!("invalid admin address: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();

        assert!(settings.gate.pow);
        assert!(settings.gate.rate_limit);
        assert_eq!(settings.gate.challenge_path, "/pow");
        assert_eq!(settings.gate.lookup_timeout(), Duration::from_millis(50));
        assert!(settings.redis.url.is_none());
        assert_eq!(settings.rate_limit.max_requests, 100);
        assert_eq!(settings.session.cookie_name, "shield_sid");
        assert_eq!(settings.monitor.interval_seconds, 300);
        assert_eq!(settings.server.max_body_bytes, 10 * 1024 * 1024);
        assert_eq!(settings.session.max_sessions, 100_000);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_challenge_path_must_not_cover_everything() {
        for path in ["", "/", "//", "pow"] {
            let gate = GateConfig {
                challenge_path: path.to_string(),
                ..GateConfig::default()
            };
            assert!(gate.validate().is_err(), "{:?} accepted", path);
        }

        let gate = GateConfig {
            challenge_path: "/challenge/".to_string(),
            ..GateConfig::default()
        };
        assert!(gate.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let json = r#"{
            "gate": { "pow": false },
            "redis": { "url": "redis://cache:6379" },
            "metrics": { "listen": "0.0.0.0:9000" },
            "blacklist": { "ips": ["203.0.113.7", "2001:db8::1"] }
        }"#;

        let settings: Settings = serde_json::from_str(json).unwrap();

        assert!(!settings.gate.pow);
        assert!(settings.gate.rate_limit);
        assert_eq!(settings.gate.challenge_path, "/pow");
        assert_eq!(settings.redis.url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(settings.metrics.listen, Some("0.0.0.0:9000".parse().unwrap()));
        assert_eq!(settings.server.port, 3000);
        assert_eq!(settings.blacklist.ips.len(), 2);
        assert_eq!(settings.blacklist.expiration_seconds, 0);
    }

    #[test]
    fn test_listen_addr() {
        let settings = Settings::default();
        assert_eq!(settings.listen_addr().unwrap(), "127.0.0.1:3000".parse().unwrap());
        assert_eq!(settings.admin_addr().unwrap(), "127.0.0.1:3001".parse().unwrap());
    }
}
