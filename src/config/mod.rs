//! Configuration management for the edge shield.
//! This module handles loading and managing configuration settings
//! from environment variables and configuration files.

mod settings;

pub use settings::{
    AdminConfig, AuditConfig, BlacklistConfig, GateConfig, MetricsConfig, MonitorConfig,
    RateLimitConfig, RedisConfig, ServerConfig, SessionConfig, Settings, UpstreamConfig,
    WafConfig,
};

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, config::ConfigError>;

/// Load the application configuration
pub fn load_config() -> ConfigResult<Settings> {
    Settings::load()
}
