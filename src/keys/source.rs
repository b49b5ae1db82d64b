//! Where the raw key secret comes from

use std::path::PathBuf;

use async_trait::async_trait;

use crate::config::expand_home;
use crate::{Error, Result};

/// A place the raw key secret can be read from.
///
/// Sources are read again whenever the registry cache expires, so rotation
/// only requires updating the source.
#[async_trait]
pub trait KeySource: Send + Sync {
    /// Read the raw secret
    async fn fetch(&self) -> Result<String>;

    /// Human-readable description for logs (never the secret itself)
    fn describe(&self) -> String;
}

/// Reads the secret from an environment variable
#[derive(Debug, Clone)]
pub struct EnvKeySource {
    var: String,
}

impl EnvKeySource {
    /// Source backed by `var`
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

#[async_trait]
impl KeySource for EnvKeySource {
    async fn fetch(&self) -> Result<String> {
        std::env::var(&self.var)
            .map_err(|_| Error::KeySource(format!("environment variable {} is not set", self.var)))
    }

    fn describe(&self) -> String {
        format!("env:{}", self.var)
    }
}

/// Reads the secret from a file, e.g. a mounted secret or a key file
/// maintained with `mcp-hub keys`
#[derive(Debug, Clone)]
pub struct FileKeySource {
    path: PathBuf,
}

impl FileKeySource {
    /// Source backed by the file at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl KeySource for FileKeySource {
    async fn fetch(&self) -> Result<String> {
        let mut raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            Error::KeySource(format!("cannot read {}: {e}", self.path.display()))
        })?;
        // Only the final line ending is dropped
        if raw.ends_with('\n') {
            raw.pop();
            if raw.ends_with('\r') {
                raw.pop();
            }
        }
        Ok(raw)
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

/// A secret given inline
#[derive(Clone)]
pub struct StaticKeySource {
    raw: String,
}

impl StaticKeySource {
    /// Source that always yields `raw`
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }
}

#[async_trait]
impl KeySource for StaticKeySource {
    async fn fetch(&self) -> Result<String> {
        Ok(self.raw.clone())
    }

    fn describe(&self) -> String {
        "inline".to_string()
    }
}

/// Build a source from its configuration form: `env:VAR`, `file:PATH`,
/// or a literal secret.
#[must_use]
pub fn key_source_from_spec(spec: &str) -> Box<dyn KeySource> {
    if let Some(var) = spec.strip_prefix("env:") {
        Box::new(EnvKeySource::new(var.trim()))
    } else if let Some(path) = spec.strip_prefix("file:") {
        Box::new(FileKeySource::new(expand_home(path.trim())))
    } else {
        Box::new(StaticKeySource::new(spec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn env_source_reads_variable() {
        let mut env_file = tempfile::NamedTempFile::new().unwrap();
        writeln!(env_file, "MCP_HUB_TEST_ENV_SOURCE_KEY=k-env").unwrap();
        dotenvy::from_path(env_file.path()).unwrap();

        let source = key_source_from_spec("env:MCP_HUB_TEST_ENV_SOURCE_KEY");
        assert_eq!(source.fetch().await.unwrap(), "k-env");
        assert_eq!(source.describe(), "env:MCP_HUB_TEST_ENV_SOURCE_KEY");
    }

    #[tokio::test]
    async fn env_source_missing_variable_errors() {
        let source = EnvKeySource::new("MCP_HUB_TEST_DEFINITELY_UNSET");
        let err = source.fetch().await.unwrap_err();
        assert!(err.to_string().contains("MCP_HUB_TEST_DEFINITELY_UNSET"));
    }

    #[tokio::test]
    async fn file_source_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"alice": "k-a"}}"#).unwrap();

        let spec = format!("file:{}", file.path().display());
        let source = key_source_from_spec(&spec);
        assert_eq!(source.fetch().await.unwrap(), r#"{"alice": "k-a"}"#);
    }

    #[tokio::test]
    async fn file_source_drops_only_final_line_ending() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, " raw-key \r\n").unwrap();

        let source = FileKeySource::new(file.path());
        assert_eq!(source.fetch().await.unwrap(), " raw-key ");
    }

    #[tokio::test]
    async fn file_source_missing_file_errors() {
        let source = FileKeySource::new("/nonexistent/keys.json");
        assert!(source.fetch().await.is_err());
    }

    #[tokio::test]
    async fn literal_spec_is_static() {
        let source = key_source_from_spec("k-1,k-2");
        assert_eq!(source.fetch().await.unwrap(), "k-1,k-2");
        assert_eq!(source.describe(), "inline");
    }
}
