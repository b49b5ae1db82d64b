//! Configuration management

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Dotenv files applied before keys are resolved (`~/` allowed).
    /// Variables already set are kept.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Session lifecycle and admission configuration
    pub session: SessionConfig,
    /// Authentication configuration
    pub auth: AuthConfig,
    /// Catalog collaborator configuration
    pub catalog: CatalogConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (MCP_HUB_ prefix, `__` for nesting)
        figment = figment.merge(Env::prefixed("MCP_HUB_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.validate()?;

        Ok(config)
    }

    /// Reject settings that would make the gateway unusable
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the offending key.
    pub fn validate(&self) -> Result<()> {
        if self.session.max_sessions == 0 {
            return Err(Error::Config(
                "session.max_sessions must be at least 1".to_string(),
            ));
        }
        if self.session.reaper_interval.is_zero() {
            return Err(Error::Config(
                "session.reaper_interval must be non-zero".to_string(),
            ));
        }
        if self.auth.rate_limit_max_failures == 0 {
            return Err(Error::Config(
                "auth.rate_limit_max_failures must be at least 1".to_string(),
            ));
        }
        if self.auth.max_key_length == 0 {
            return Err(Error::Config(
                "auth.max_key_length must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply `env_files` to the process environment, in order. Missing
    /// files are skipped.
    fn load_env_files(&self) {
        for entry in &self.env_files {
            let path = expand_home(entry);
            if !path.exists() {
                tracing::debug!(path = %path.display(), "Env file not found (skipped)");
                continue;
            }
            match dotenvy::from_path(&path) {
                Ok(()) => tracing::info!(path = %path.display(), "Loaded env file"),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to load env file"),
            }
        }
    }
}

/// Expand a leading `~/` to the home directory
pub(crate) fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
    /// Allowed cross-origin sources. Empty means same-origin only.
    #[serde(deserialize_with = "comma_list::deserialize")]
    pub cors_origins: Vec<String>,
    /// Trust the first `x-forwarded-for` hop as the client address
    pub trust_proxy: bool,
    /// Upper bound on the shutdown drain before the process gives up
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            max_body_size: 1024 * 1024, // 1MB
            cors_origins: Vec::new(),
            trust_proxy: false,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Session lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Sessions idle for longer than this are reaped
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Maximum number of concurrently open sessions
    pub max_sessions: usize,
    /// How often the idle reaper runs
    #[serde(with = "humantime_serde")]
    pub reaper_interval: Duration,
    /// Server-to-client notification buffer per session
    pub notification_buffer: usize,
    /// Keep-alive interval for the streaming channel
    #[serde(with = "humantime_serde")]
    pub keep_alive_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30 * 60),
            max_sessions: 100,
            reaper_interval: Duration::from_secs(60),
            notification_buffer: 64,
            keep_alive_interval: Duration::from_secs(15),
        }
    }
}

/// Authentication configuration for gateway access
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Enable authentication. Disable only for local development.
    pub enabled: bool,
    /// Where the raw key secret comes from.
    /// Supports `env:VAR_NAME`, `file:PATH`, or a literal value.
    pub api_keys: String,
    /// How long a resolved key set is reused before the source is read again
    #[serde(with = "humantime_serde")]
    pub key_cache_ttl: Duration,
    /// Credentials longer than this are rejected outright
    pub max_key_length: usize,
    /// Length of the failed-attempt window per client address
    #[serde(with = "humantime_serde")]
    pub rate_limit_window: Duration,
    /// Failures inside one window before the address is throttled
    pub rate_limit_max_failures: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_keys: "env:API_KEY".to_string(),
            key_cache_ttl: Duration::from_secs(300),
            max_key_length: 256,
            rate_limit_window: Duration::from_secs(60),
            rate_limit_max_failures: 10,
        }
    }
}

/// Catalog collaborator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Optional JSON or YAML file to seed the in-memory catalog from
    pub path: Option<String>,
}

/// Accept either a sequence or a comma-separated string
mod comma_list {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        List(Vec<String>),
        Joined(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let list = match Raw::deserialize(deserializer)? {
            Raw::List(items) => items,
            Raw::Joined(s) => s.split(',').map(str::to_string).collect(),
        };
        Ok(list
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect())
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => return Ok(Duration::from_secs(secs)),
            Raw::Text(s) => s,
        };
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse "30s", "5m", "100ms", "1h" or bare seconds
    pub(crate) fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        let s = s.trim();
        // "ms" must be checked before "m" and "s"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}
