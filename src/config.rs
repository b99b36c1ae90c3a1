use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::services::PullApplyPolicy;

#[derive(Debug, Error)]
#[error("configuration error: {0}")]
pub struct ConfigError(pub String);

/// Device-side settings.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    /// Sync server root. Without it the app runs offline-only.
    pub sync_base_url: Option<String>,
    pub sync_user_id: Option<String>,
    /// Seconds between scheduled syncs; 0 turns the scheduler off.
    pub sync_interval_secs: u64,
    pub request_timeout: Option<Duration>,
    pub pull_apply_policy: PullApplyPolicy,
    pub host: String,
    pub port: u16,
}

impl AppConfig {
    /// Loads `.env` if present, then reads the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let pull_apply_policy = match get("PULL_APPLY_POLICY") {
            Some(raw) => raw.parse().map_err(ConfigError)?,
            None => PullApplyPolicy::default(),
        };

        Ok(Self {
            database_url: get("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://tasksync.db?mode=rwc".to_string()),
            sync_base_url: get("SYNC_BASE_URL"),
            sync_user_id: get("SYNC_USER_ID"),
            sync_interval_secs: parse_or(get("SYNC_INTERVAL_SECS"), "SYNC_INTERVAL_SECS", 300)?,
            request_timeout: get("SYNC_REQUEST_TIMEOUT_SECS")
                .map(|raw| parse_num::<u64>(&raw, "SYNC_REQUEST_TIMEOUT_SECS"))
                .transpose()?
                .map(Duration::from_secs),
            pull_apply_policy,
            host: get("HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: parse_or(get("PORT"), "PORT", 3000)?,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Settings for the reference sync server binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub database_url: String,
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Ok(Self {
            database_url: get("SERVER_DATABASE_URL")
                .unwrap_or_else(|| "sqlite://sync_server.db?mode=rwc".to_string()),
            host: get("SERVER_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: parse_or(get("SERVER_PORT"), "SERVER_PORT", 4000)?,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_num<T: std::str::FromStr>(raw: &str, key: &str) -> Result<T, ConfigError> {
    raw.parse()
        .map_err(|_| ConfigError(format!("invalid {key}: {raw:?}")))
}

fn parse_or<T: std::str::FromStr>(
    raw: Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match raw {
        Some(raw) => parse_num(&raw, key),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = AppConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.database_url, "sqlite://tasksync.db?mode=rwc");
        assert_eq!(cfg.sync_base_url, None);
        assert_eq!(cfg.sync_interval_secs, 300);
        assert_eq!(cfg.request_timeout, None);
        assert_eq!(cfg.pull_apply_policy, PullApplyPolicy::Abort);
        assert_eq!(cfg.bind_addr(), "127.0.0.1:3000");
    }

    #[test]
    fn reads_sync_settings() {
        let cfg = AppConfig::from_lookup(lookup(&[
            ("SYNC_BASE_URL", "https://sync.example.com"),
            ("SYNC_USER_ID", "1b4e28ba-2fa1-11d2-883f-0016d3cca427"),
            ("SYNC_INTERVAL_SECS", "0"),
            ("SYNC_REQUEST_TIMEOUT_SECS", "15"),
            ("PULL_APPLY_POLICY", "skip"),
        ]))
        .unwrap();

        assert_eq!(cfg.sync_base_url.as_deref(), Some("https://sync.example.com"));
        assert_eq!(cfg.sync_interval_secs, 0);
        assert_eq!(cfg.request_timeout, Some(Duration::from_secs(15)));
        assert_eq!(cfg.pull_apply_policy, PullApplyPolicy::SkipMalformed);
    }

    #[test]
    fn blank_values_count_as_unset() {
        let cfg = AppConfig::from_lookup(lookup(&[("SYNC_BASE_URL", "   ")])).unwrap();
        assert_eq!(cfg.sync_base_url, None);
    }

    #[test]
    fn rejects_bad_numbers_and_policies() {
        assert!(AppConfig::from_lookup(lookup(&[("PORT", "eighty")])).is_err());
        assert!(AppConfig::from_lookup(lookup(&[("PULL_APPLY_POLICY", "merge")])).is_err());
    }

    #[test]
    fn server_config_defaults() {
        let cfg = ServerConfig::from_lookup(lookup(&[("SERVER_PORT", "4100")])).unwrap();
        assert_eq!(cfg.bind_addr(), "127.0.0.1:4100");
        assert_eq!(cfg.database_url, "sqlite://sync_server.db?mode=rwc");
    }
}
