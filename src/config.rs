//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub federation: FederationConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "social.example.com")
    pub domain: String,
    /// Optional display hostname users present as (`name@masq_domain`)
    pub masq_domain: Option<String>,
    /// Protocol ("http" or "https")
    pub protocol: String,
    /// First local account, created at startup if absent
    pub primary_user: String,
}

impl ServerConfig {
    /// Full URL like "https://social.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }

    /// Hostname shown in handles; falls back to the canonical domain
    pub fn masq(&self) -> &str {
        self.masq_domain.as_deref().unwrap_or(&self.domain)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Federation behavior knobs
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Interactive fetch deadline in seconds (webfinger, quote expansion)
    pub fast_timeout_secs: u64,
    /// Content fetch deadline in seconds; POST delivery uses twice this
    pub slow_timeout_secs: u64,
    /// Maximum concurrent deliveries across all recipients
    pub max_deliveries: usize,
    /// Accept cross-origin Create payloads by re-fetching the object from
    /// its authoritative origin instead of refusing the request
    pub collect_forwards: bool,
    /// Development mode: skip origin checks and request signing on fetches
    pub devel: bool,
    /// Advertise jpeg attachments with an avif alternative link
    pub convert_avif: bool,
    /// Accept avif attachments when peers offer alternatives
    pub accept_avif: bool,
}

impl FederationConfig {
    pub fn fast_timeout(&self) -> Duration {
        Duration::from_secs(self.fast_timeout_secs)
    }

    pub fn slow_timeout(&self) -> Duration {
        Duration::from_secs(self.slow_timeout_secs)
    }

    /// Delivery body deadline: 2x the slow timeout
    pub fn post_timeout(&self) -> Duration {
        Duration::from_secs(self.slow_timeout_secs * 2)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (GAGGLE__*)
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "https")?
            .set_default("server.primary_user", "gaggle")?
            .set_default("database.path", "gaggle.db")?
            .set_default("federation.fast_timeout_secs", 5)?
            .set_default("federation.slow_timeout_secs", 30)?
            .set_default("federation.max_deliveries", 40)?
            .set_default("federation.collect_forwards", true)?
            .set_default("federation.devel", false)?
            .set_default("federation.convert_avif", false)?
            .set_default("federation.accept_avif", false)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("GAGGLE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<(), crate::error::AppError> {
        if self.server.domain.trim().is_empty() {
            return Err(crate::error::AppError::Config(
                "server.domain must be set".to_string(),
            ));
        }
        if self.federation.slow_timeout_secs == 0 || self.federation.fast_timeout_secs == 0 {
            return Err(crate::error::AppError::Config(
                "federation timeouts must be greater than 0".to_string(),
            ));
        }
        if self.federation.max_deliveries == 0 {
            return Err(crate::error::AppError::Config(
                "federation.max_deliveries must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub fn test_config() -> AppConfig {
        AppConfig {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                domain: "example.com".to_string(),
                masq_domain: None,
                protocol: "https".to_string(),
                primary_user: "alice".to_string(),
            },
            database: DatabaseConfig {
                path: PathBuf::from(":memory:"),
            },
            federation: FederationConfig {
                fast_timeout_secs: 5,
                slow_timeout_secs: 30,
                max_deliveries: 40,
                collect_forwards: true,
                devel: false,
                convert_avif: false,
                accept_avif: false,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }

    #[test]
    fn validate_rejects_zero_timeouts() {
        let mut config = test_config();
        config.federation.slow_timeout_secs = 0;
        let error = config.validate().expect_err("zero timeout must fail");
        assert!(matches!(
            error,
            crate::error::AppError::Config(message) if message.contains("timeouts")
        ));
    }

    #[test]
    fn masq_falls_back_to_domain() {
        let mut config = test_config();
        assert_eq!(config.server.masq(), "example.com");
        config.server.masq_domain = Some("social.example".to_string());
        assert_eq!(config.server.masq(), "social.example");
    }

    #[test]
    fn post_timeout_doubles_slow() {
        let config = test_config();
        assert_eq!(
            config.federation.post_timeout(),
            Duration::from_secs(config.federation.slow_timeout_secs * 2)
        );
    }
}
