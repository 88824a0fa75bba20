use std::{env, fmt::Display, str::FromStr};

use thiserror::Error;
use tracing::warn;

pub const DEFAULT_JWT_SECRET: &str = "kamehouse-dev-secret-change-me";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("expected text or json, got {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub jwt_secret: String,
    pub token_ttl_hours: i64,
    /// Empty means any origin.
    pub cors_origins: Vec<String>,
    pub log_format: LogFormat,
    pub log_dir: Option<String>,
    pub lets_credit_limit: i64,
    /// Base URL handed to clients that reach the API through a non-local host.
    pub public_url: Option<String>,
    pub password_hash_memory_kib: u32,
    pub password_hash_iterations: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            database_url: "sqlite://kamehouse.sqlite3".to_string(),
            jwt_secret: DEFAULT_JWT_SECRET.to_string(),
            token_ttl_hours: 24 * 7,
            cors_origins: Vec::new(),
            log_format: LogFormat::Text,
            log_dir: None,
            lets_credit_limit: 100,
            public_url: None,
            password_hash_memory_kib: 19 * 1024,
            password_hash_iterations: 2,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let jwt_secret = lookup("KAMEHOUSE_JWT_SECRET").unwrap_or_else(|| {
            warn!(
                target: "kamehouse",
                event = "config_default_secret",
                "KAMEHOUSE_JWT_SECRET not set, using the development secret"
            );
            defaults.jwt_secret.clone()
        });

        let config = Self {
            host: lookup("KAMEHOUSE_HOST").unwrap_or(defaults.host),
            port: try_load(&lookup, "KAMEHOUSE_PORT", defaults.port)?,
            database_url: lookup("KAMEHOUSE_DATABASE_URL").unwrap_or(defaults.database_url),
            jwt_secret,
            token_ttl_hours: try_load(&lookup, "KAMEHOUSE_TOKEN_TTL_HOURS", defaults.token_ttl_hours)?,
            cors_origins: lookup("KAMEHOUSE_CORS_ORIGINS")
                .map(|raw| parse_list(&raw))
                .unwrap_or_default(),
            log_format: try_load(&lookup, "KAMEHOUSE_LOG_FORMAT", defaults.log_format)?,
            log_dir: lookup("KAMEHOUSE_LOG_DIR").filter(|dir| !dir.trim().is_empty()),
            lets_credit_limit: try_load(
                &lookup,
                "KAMEHOUSE_LETS_CREDIT_LIMIT",
                defaults.lets_credit_limit,
            )?,
            public_url: lookup("KAMEHOUSE_PUBLIC_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .filter(|url| !url.is_empty()),
            password_hash_memory_kib: try_load(
                &lookup,
                "KAMEHOUSE_PASSWORD_HASH_MEMORY_KIB",
                defaults.password_hash_memory_kib,
            )?,
            password_hash_iterations: try_load(
                &lookup,
                "KAMEHOUSE_PASSWORD_HASH_ITERATIONS",
                defaults.password_hash_iterations,
            )?,
        };

        if config.token_ttl_hours <= 0 {
            return Err(ConfigError::Invalid {
                key: "KAMEHOUSE_TOKEN_TTL_HOURS",
                value: config.token_ttl_hours.to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if config.lets_credit_limit < 0 {
            return Err(ConfigError::Invalid {
                key: "KAMEHOUSE_LETS_CREDIT_LIMIT",
                value: config.lets_credit_limit.to_string(),
                reason: "must not be negative".to_string(),
            });
        }

        Ok(config)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// API base URL a client should use when it reached us via `hostname`.
    ///
    /// Local hostnames get the loopback address on the configured port; any
    /// other host gets the configured public URL, or its own origin.
    pub fn api_base_url_for_host(&self, hostname: &str) -> (Environment, String) {
        let bare = hostname
            .rsplit_once(':')
            .filter(|(_, port)| port.chars().all(|c| c.is_ascii_digit()))
            .map(|(host, _)| host)
            .unwrap_or(hostname);
        if matches!(bare, "localhost" | "127.0.0.1" | "[::1]" | "0.0.0.0") {
            (
                Environment::Local,
                format!("http://localhost:{}/api", self.port),
            )
        } else {
            let base = self
                .public_url
                .clone()
                .unwrap_or_else(|| format!("https://{hostname}"));
            (Environment::Deployed, format!("{base}/api"))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Local,
    Deployed,
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty() && *item != "*")
        .map(str::to_string)
        .collect()
}

fn try_load<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| {
            warn!(target: "kamehouse", event = "config_invalid", key, error = %e);
            ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            }
        }),
    }
}
