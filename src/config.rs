//! Runtime configuration, read from the environment (and a `.env` file).

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ReplicatorError, Result};

pub const DEFAULT_LISTEN_CHANNEL: &str = "nis2_changes";
pub const DEFAULT_KEY_DIRECTORY: &str = "./keys";

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Required by `run` and `install-trigger` only
    pub database_url: Option<String>,
    pub listen_channel: String,
    pub cloud_api_url: Option<String>,
    pub cloud_api_token: Option<String>,
    pub key_directory: PathBuf,
    pub active_key_id: Option<String>,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub dry_run: bool,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    /// Allow an ephemeral in-memory key when the key directory is empty
    pub demo_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            listen_channel: DEFAULT_LISTEN_CHANNEL.to_string(),
            cloud_api_url: None,
            cloud_api_token: None,
            key_directory: PathBuf::from(DEFAULT_KEY_DIRECTORY),
            active_key_id: None,
            batch_size: 100,
            flush_interval: Duration::from_secs(5),
            retry_attempts: 3,
            retry_delay: Duration::from_secs(5),
            dry_run: false,
            poll_interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            demo_mode: false,
        }
    }
}

impl Config {
    /// Load from the process environment after applying any `.env` file.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let config = Self {
            database_url: get("DATABASE_URL"),
            listen_channel: get("LISTEN_CHANNEL").unwrap_or(defaults.listen_channel),
            cloud_api_url: get("CLOUD_API_URL").map(|url| url.trim_end_matches('/').to_string()),
            cloud_api_token: get("CLOUD_API_TOKEN"),
            key_directory: get("KEY_DIRECTORY").map(PathBuf::from).unwrap_or(defaults.key_directory),
            active_key_id: get("ACTIVE_KEY_ID"),
            batch_size: parse_or("BATCH_SIZE", get("BATCH_SIZE"), defaults.batch_size)?,
            flush_interval: seconds_or(
                "FLUSH_INTERVAL_SECONDS",
                get("FLUSH_INTERVAL_SECONDS"),
                defaults.flush_interval,
            )?,
            retry_attempts: parse_or("RETRY_ATTEMPTS", get("RETRY_ATTEMPTS"), defaults.retry_attempts)?,
            retry_delay: seconds_or("RETRY_DELAY_SECONDS", get("RETRY_DELAY_SECONDS"), defaults.retry_delay)?,
            dry_run: bool_or("DRY_RUN", get("DRY_RUN"), defaults.dry_run)?,
            poll_interval: seconds_or(
                "POLL_INTERVAL_SECONDS",
                get("POLL_INTERVAL_SECONDS"),
                defaults.poll_interval,
            )?,
            request_timeout: seconds_or(
                "REQUEST_TIMEOUT_SECONDS",
                get("REQUEST_TIMEOUT_SECONDS"),
                defaults.request_timeout,
            )?,
            demo_mode: bool_or("DEMO_MODE", get("DEMO_MODE"), defaults.demo_mode)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(ReplicatorError::Config("BATCH_SIZE must be at least 1".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(ReplicatorError::Config("POLL_INTERVAL_SECONDS must be positive".into()));
        }
        if self.request_timeout.is_zero() {
            return Err(ReplicatorError::Config("REQUEST_TIMEOUT_SECONDS must be positive".into()));
        }
        Ok(())
    }

    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .ok_or_else(|| ReplicatorError::Config("DATABASE_URL must be set".into()))
    }
}

fn parse_or<T: FromStr>(name: &str, value: Option<String>, default: T) -> Result<T> {
    match value {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ReplicatorError::Config(format!("{} is not a valid number: {:?}", name, raw))),
    }
}

fn seconds_or(name: &str, value: Option<String>, default: Duration) -> Result<Duration> {
    parse_or(name, value, default.as_secs()).map(Duration::from_secs)
}

fn bool_or(name: &str, value: Option<String>, default: bool) -> Result<bool> {
    let Some(raw) = value else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ReplicatorError::Config(format!("{} is not a valid boolean: {:?}", name, raw))),
    }
}
