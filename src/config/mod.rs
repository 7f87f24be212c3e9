//! Configuration loading and validation.

mod defaults;

use defaults::{default_api_base, default_basedir, default_invite_award_days, default_redis_host, default_redis_port};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Platform credentials shared by all relays.
#[derive(Debug, Clone, Deserialize)]
pub struct TeleConfig {
    pub api_id: i64,
    pub api_hash: String,
    /// Gateway endpoint; override for self-hosted gateways and tests.
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

/// The operator relay.
#[derive(Debug, Clone, Deserialize)]
pub struct FatherConfig {
    /// Credential of the operator bot.
    pub token: String,
    /// PRIME duration granted when an invite is fulfilled.
    #[serde(default = "default_invite_award_days")]
    pub invite_award_days: i64,
}

/// External cache backing; absent means the in-process substitute.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_host")]
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub db: i64,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub tele: TeleConfig,
    pub father: FatherConfig,
    /// Storage root for the database and client workdirs.
    #[serde(default = "default_basedir")]
    pub basedir: String,
    /// Optional outbound proxy URL.
    pub proxy: Option<String>,
    pub redis: Option<RedisConfig>,
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Config {
    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}

/// Validate the configuration, collecting every error.
pub fn validate(config: &Config) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();
    if config.tele.api_id <= 0 {
        errors.push("tele.api_id must be a positive integer".to_string());
    }
    if config.tele.api_hash.trim().is_empty() {
        errors.push("tele.api_hash must not be empty".to_string());
    }
    if config.father.token.trim().is_empty() {
        errors.push("father.token must not be empty".to_string());
    }
    if config.father.invite_award_days <= 0 {
        errors.push("father.invite_award_days must be positive".to_string());
    }
    if config.basedir.trim().is_empty() {
        errors.push("basedir must not be empty".to_string());
    }
    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config: Config = toml::from_str(
            r#"
            [tele]
            api_id = 12345
            api_hash = "abcdef"

            [father]
            token = "100:token"
            "#,
        )
        .unwrap();
        assert_eq!(config.father.invite_award_days, 180);
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert!(config.redis.is_none());
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn validation_collects_all_errors() {
        let config: Config = toml::from_str(
            r#"
            [tele]
            api_id = 0
            api_hash = ""

            [father]
            token = ""
            "#,
        )
        .unwrap();
        let errors = validate(&config).unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn redis_section_is_optional_with_defaults() {
        let config: Config = toml::from_str(
            r#"
            [tele]
            api_id = 1
            api_hash = "h"

            [father]
            token = "t"

            [redis]
            password = "secret"
            "#,
        )
        .unwrap();
        let redis = config.redis.unwrap();
        assert_eq!(redis.host, "localhost");
        assert_eq!(redis.port, 6379);
        assert_eq!(redis.db, 0);
    }
}
