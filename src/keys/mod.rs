//! Key registry: the set of API keys the gateway accepts.
//!
//! The raw secret is a single string that can take any of four shapes, tried
//! in order:
//!
//! 1. JSON object `{"alice": "k-a", "bob": "k-b"}`: named keys
//! 2. JSON array `["k-1", "k-2"]`: named `key-0`, `key-1`, ...
//! 3. Comma list `k-1,k-2`: named `key-0`, `key-1`, ...
//! 4. Anything else: one key named `default`
//!
//! Resolution never fails. A malformed secret degrades to shape 4, so a
//! misconfigured deployment rejects every credential instead of crashing.
//! Key names exist for attribution only; authorization is purely "does the
//! presented credential match any key".

mod file;
mod source;

pub use file::{generate_key, load_key_file, mask_key, save_key_file};
pub use source::{EnvKeySource, FileKeySource, KeySource, StaticKeySource, key_source_from_spec};

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::Result;

/// Name given to the sole key of an unstructured secret
pub const DEFAULT_KEY_NAME: &str = "default";

/// A named API key
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey {
    /// Attribution name (audit only)
    pub name: String,
    /// Secret value
    pub key: String,
}

impl ApiKey {
    /// Create a named key
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
        }
    }
}

// Secrets never reach logs through Debug.
impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKey")
            .field("name", &self.name)
            .field("key", &mask_key(&self.key))
            .finish()
    }
}

fn positional_name(index: usize) -> String {
    format!("key-{index}")
}

/// Resolve a raw secret into named keys.
///
/// Empty secrets are dropped, so an empty credential can never match.
#[must_use]
pub fn resolve_keys(raw: &str) -> Vec<ApiKey> {
    let keys = match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map
            .into_iter()
            .filter_map(|(name, value)| match value {
                Value::String(key) => Some(ApiKey::new(name, key)),
                _ => {
                    warn!(key_name = %name, "Ignoring non-string key entry");
                    None
                }
            })
            .collect(),
        Ok(Value::Array(items)) => items
            .into_iter()
            .enumerate()
            .filter_map(|(i, value)| match value {
                Value::String(key) => Some(ApiKey::new(positional_name(i), key)),
                _ => None,
            })
            .collect(),
        _ if raw.contains(',') => raw
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .enumerate()
            .map(|(i, key)| ApiKey::new(positional_name(i), key))
            .collect(),
        _ => vec![ApiKey::new(DEFAULT_KEY_NAME, raw)],
    };

    keys.into_iter().filter(|k| !k.key.is_empty()).collect()
}

struct CachedKeys {
    fetched_at: Instant,
    keys: Arc<[ApiKey]>,
}

/// Key registry backed by a [`KeySource`], cached for a TTL.
///
/// Rotation does not need sub-second propagation, so the source is read at
/// most once per TTL. When a refresh fails the previous key set keeps being
/// served.
pub struct KeyRegistry {
    source: Arc<dyn KeySource>,
    ttl: Duration,
    cache: RwLock<Option<CachedKeys>>,
}

impl KeyRegistry {
    /// Create a registry over `source`
    pub fn new(source: Arc<dyn KeySource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            cache: RwLock::new(None),
        }
    }

    /// Registry over a fixed raw secret (tests, stdio)
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self::new(Arc::new(StaticKeySource::new(raw)), Duration::MAX)
    }

    /// Current key set
    ///
    /// # Errors
    ///
    /// Returns the source's error if it cannot be read and nothing is cached.
    pub async fn keys(&self) -> Result<Arc<[ApiKey]>> {
        if let Some(cached) = self.cache.read().as_ref() {
            if cached.fetched_at.elapsed() < self.ttl {
                return Ok(Arc::clone(&cached.keys));
            }
        }

        match self.source.fetch().await {
            Ok(raw) => {
                let keys: Arc<[ApiKey]> = resolve_keys(&raw).into();
                debug!(
                    source = %self.source.describe(),
                    count = keys.len(),
                    "Refreshed API keys"
                );
                *self.cache.write() = Some(CachedKeys {
                    fetched_at: Instant::now(),
                    keys: Arc::clone(&keys),
                });
                Ok(keys)
            }
            Err(e) => {
                if let Some(cached) = self.cache.read().as_ref() {
                    warn!(
                        source = %self.source.describe(),
                        error = %e,
                        "Key refresh failed, serving previous keys"
                    );
                    return Ok(Arc::clone(&cached.keys));
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::Error;

    #[test]
    fn resolves_named_keys() {
        let keys = resolve_keys(r#"{"alice": "key-a", "bob": "key-b"}"#);
        assert_eq!(
            keys,
            vec![ApiKey::new("alice", "key-a"), ApiKey::new("bob", "key-b")]
        );
    }

    #[test]
    fn resolves_json_array_positionally() {
        let keys = resolve_keys(r#"["key-1", "key-2"]"#);
        assert_eq!(
            keys,
            vec![ApiKey::new("key-0", "key-1"), ApiKey::new("key-1", "key-2")]
        );
    }

    #[test]
    fn resolves_comma_list() {
        let keys = resolve_keys("aaa, bbb,ccc");
        assert_eq!(keys.len(), 3);
        assert_eq!(keys[1], ApiKey::new("key-1", "bbb"));
    }

    #[test]
    fn resolves_single_key() {
        assert_eq!(
            resolve_keys("single-key"),
            vec![ApiKey::new("default", "single-key")]
        );
    }

    #[test]
    fn malformed_json_degrades_to_default() {
        let raw = r#"{"alice": "#;
        assert_eq!(resolve_keys(raw), vec![ApiKey::new("default", raw)]);
    }

    #[test]
    fn single_key_is_kept_verbatim() {
        assert_eq!(resolve_keys(" padded "), vec![ApiKey::new("default", " padded ")]);
    }

    #[test]
    fn scalar_json_is_single_key() {
        assert_eq!(resolve_keys("12345"), vec![ApiKey::new("default", "12345")]);
    }

    #[test]
    fn empty_secrets_are_dropped() {
        assert!(resolve_keys("").is_empty());
        assert!(resolve_keys(r#"{"alice": ""}"#).is_empty());
        assert_eq!(resolve_keys("a,,b").len(), 2);
    }

    #[test]
    fn non_string_entries_are_skipped() {
        let keys = resolve_keys(r#"{"alice": "k-a", "bob": 7}"#);
        assert_eq!(keys, vec![ApiKey::new("alice", "k-a")]);
    }

    #[test]
    fn debug_masks_secret() {
        let printed = format!("{:?}", ApiKey::new("alice", "mal_supersecretvalue1234"));
        assert!(printed.contains("alice"));
        assert!(!printed.contains("supersecretvalue"));
    }

    struct CountingSource {
        fetches: AtomicUsize,
        fail_after: usize,
    }

    #[async_trait]
    impl KeySource for CountingSource {
        async fn fetch(&self) -> Result<String> {
            let n = self.fetches.fetch_add(1, Ordering::SeqCst);
            if n >= self.fail_after {
                return Err(Error::KeySource("unavailable".to_string()));
            }
            Ok(format!("{{\"gen\": \"key-{n}\"}}"))
        }

        fn describe(&self) -> String {
            "counting".to_string()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn registry_caches_for_ttl() {
        let source = Arc::new(CountingSource {
            fetches: AtomicUsize::new(0),
            fail_after: usize::MAX,
        });
        let registry = KeyRegistry::new(source.clone(), Duration::from_secs(300));

        assert_eq!(registry.keys().await.unwrap()[0].key, "key-0");
        assert_eq!(registry.keys().await.unwrap()[0].key, "key-0");
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(registry.keys().await.unwrap()[0].key, "key-1");
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn registry_serves_stale_keys_when_refresh_fails() {
        let source = Arc::new(CountingSource {
            fetches: AtomicUsize::new(0),
            fail_after: 1,
        });
        let registry = KeyRegistry::new(source, Duration::from_secs(1));

        assert_eq!(registry.keys().await.unwrap()[0].key, "key-0");
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(registry.keys().await.unwrap()[0].key, "key-0");
    }

    #[tokio::test]
    async fn registry_errors_without_cache() {
        let source = Arc::new(CountingSource {
            fetches: AtomicUsize::new(0),
            fail_after: 0,
        });
        let registry = KeyRegistry::new(source, Duration::from_secs(1));
        assert!(registry.keys().await.is_err());
    }
}
