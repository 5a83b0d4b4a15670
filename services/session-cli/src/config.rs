//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Credentials never go in the TOML. They come from the credentials file or
//! the SESSION_ACCESS_TOKEN / SESSION_REFRESH_TOKEN env vars.

use common::Secret;
use serde::Deserialize;
use session_client::DEFAULT_MAX_ATTEMPTS;
use std::path::{Path, PathBuf};

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub auth: AuthConfig,
    pub api: ApiConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

/// Authorization server settings
#[derive(Debug, Deserialize)]
pub struct AuthConfig {
    /// Prefix for `/login`, `/refresh` and `/logout`
    pub base_url: String,
}

/// Resource API settings
#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Session and credential settings
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_max_refresh_attempts")]
    pub max_refresh_attempts: u32,
    /// JSON file the credential pair persists to. In-memory only when unset.
    #[serde(default)]
    pub credentials_file: Option<PathBuf>,
    #[serde(skip)]
    pub access_token: Option<Secret<String>>,
    #[serde(skip)]
    pub refresh_token: Option<Secret<String>>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_refresh_attempts: default_max_refresh_attempts(),
            credentials_file: None,
            access_token: None,
            refresh_token: None,
        }
    }
}

fn default_timeout() -> u64 {
    30
}

fn default_max_refresh_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn validate_url(field: &str, url: &str) -> common::Result<()> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(common::Error::Config(format!(
            "{field} must start with http:// or https://, got: {url}"
        )));
    }
    Ok(())
}

fn env_secret(key: &str) -> Option<Secret<String>> {
    std::env::var(key)
        .ok()
        .map(|v| Secret::from(v.trim()))
        .filter(|s| !s.is_empty())
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        validate_url("auth.base_url", &config.auth.base_url)?;
        validate_url("api.base_url", &config.api.base_url)?;

        if config.api.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if config.session.max_refresh_attempts == 0 {
            return Err(common::Error::Config(
                "max_refresh_attempts must be greater than 0".into(),
            ));
        }

        config.session.access_token = env_secret("SESSION_ACCESS_TOKEN");
        config.session.refresh_token = env_secret("SESSION_REFRESH_TOKEN");

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("session-fetch.toml")
    }
}
