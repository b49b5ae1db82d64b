//! Catalog collaborator
//!
//! Sessions only ever see the catalog through the read-only [`Catalog`]
//! trait. One instance is shared by every session; it is injected into the
//! session factory and never owned by a session.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::{Error, Result};

/// Default page size
pub const DEFAULT_PAGE_LIMIT: usize = 20;

/// Largest page a caller may request
pub const MAX_PAGE_LIMIT: usize = 100;

/// A catalog entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Unique id within its collection
    pub id: String,
    /// Display name
    pub name: String,
    /// One-line description
    #[serde(default)]
    pub description: String,
    /// Tags used by search
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Remaining fields, kept verbatim
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl CatalogEntry {
    fn matches(&self, needle: &str) -> bool {
        self.id.to_lowercase().contains(needle)
            || self.name.to_lowercase().contains(needle)
            || self.description.to_lowercase().contains(needle)
            || self.tags.iter().any(|t| t.to_lowercase().contains(needle))
    }
}

/// Paging window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    /// Maximum items returned
    pub limit: usize,
    /// Items skipped
    pub offset: usize,
}

impl Page {
    /// Build a page from optional caller input, capping the limit
    #[must_use]
    pub fn new(limit: Option<usize>, offset: Option<usize>) -> Self {
        Self {
            limit: limit.unwrap_or(DEFAULT_PAGE_LIMIT).min(MAX_PAGE_LIMIT),
            offset: offset.unwrap_or(0),
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// One page of results
#[derive(Debug, Clone, PartialEq)]
pub struct Paginated<T> {
    /// Items in this page
    pub items: Vec<T>,
    /// Total matches across all pages
    pub total: usize,
    /// Whether more items follow this page
    pub has_more: bool,
}

impl<T: Clone> Paginated<T> {
    fn window(all: &[T], page: Page) -> Self {
        let items: Vec<T> = all.iter().skip(page.offset).take(page.limit).cloned().collect();
        Self {
            has_more: page.offset + items.len() < all.len(),
            total: all.len(),
            items,
        }
    }
}

/// Read-only catalog access shared by all sessions
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Fetch one entry
    async fn get(&self, collection: &str, id: &str) -> Result<Option<CatalogEntry>>;

    /// List a collection
    async fn list(&self, collection: &str, page: Page) -> Result<Paginated<CatalogEntry>>;

    /// Case-insensitive substring search within a collection
    async fn search(
        &self,
        collection: &str,
        query: &str,
        page: Page,
    ) -> Result<Paginated<CatalogEntry>>;

    /// Names of the collections this catalog holds
    fn collections(&self) -> Vec<String>;
}

/// In-memory catalog, optionally seeded from a JSON or YAML file shaped as
/// `{collection: [entry, ...]}`
#[derive(Debug, Clone, Default)]
pub struct MemoryCatalog {
    collections: BTreeMap<String, Vec<CatalogEntry>>,
}

impl MemoryCatalog {
    /// Empty catalog
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry to `collection` (builder style)
    #[must_use]
    pub fn with_entry(mut self, collection: &str, entry: CatalogEntry) -> Self {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .push(entry);
        self
    }

    /// Load a catalog file. `.yaml`/`.yml` are read as YAML, anything else
    /// as JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Catalog(format!("cannot read {}: {e}", path.display())))?;

        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"));

        let collections: BTreeMap<String, Vec<CatalogEntry>> = if is_yaml {
            serde_yaml::from_str(&raw).map_err(|e| Error::Catalog(e.to_string()))?
        } else {
            serde_json::from_str(&raw).map_err(|e| Error::Catalog(e.to_string()))?
        };

        let entries: usize = collections.values().map(Vec::len).sum();
        info!(
            path = %path.display(),
            collections = collections.len(),
            entries,
            "Loaded catalog"
        );

        Ok(Self { collections })
    }

    fn collection(&self, name: &str) -> Result<&[CatalogEntry]> {
        self.collections
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::Catalog(format!("unknown collection: {name}")))
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<CatalogEntry>> {
        Ok(self.collection(collection)?.iter().find(|e| e.id == id).cloned())
    }

    async fn list(&self, collection: &str, page: Page) -> Result<Paginated<CatalogEntry>> {
        Ok(Paginated::window(self.collection(collection)?, page))
    }

    async fn search(
        &self,
        collection: &str,
        query: &str,
        page: Page,
    ) -> Result<Paginated<CatalogEntry>> {
        let needle = query.to_lowercase();
        let hits: Vec<CatalogEntry> = self
            .collection(collection)?
            .iter()
            .filter(|e| e.matches(&needle))
            .cloned()
            .collect();
        Ok(Paginated::window(&hits, page))
    }

    fn collections(&self) -> Vec<String> {
        self.collections.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(id: &str, name: &str, description: &str) -> CatalogEntry {
        CatalogEntry {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            tags: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }

    fn sample() -> MemoryCatalog {
        MemoryCatalog::new()
            .with_entry("skills", entry("rust-review", "Rust Review", "Review Rust code"))
            .with_entry("skills", entry("py-lint", "Python Lint", "Lint python"))
            .with_entry("commands", entry("deploy", "Deploy", "Ship it"))
    }

    #[test]
    fn page_caps_limit() {
        assert_eq!(Page::new(None, None).limit, DEFAULT_PAGE_LIMIT);
        assert_eq!(Page::new(Some(500), Some(3)), Page { limit: 100, offset: 3 });
    }

    #[tokio::test]
    async fn get_and_list() {
        let catalog = sample();
        let hit = catalog.get("skills", "py-lint").await.unwrap().unwrap();
        assert_eq!(hit.name, "Python Lint");
        assert!(catalog.get("skills", "nope").await.unwrap().is_none());

        let page = catalog.list("skills", Page::new(Some(1), None)).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.total, 2);
        assert!(page.has_more);
    }

    #[tokio::test]
    async fn search_is_case_insensitive() {
        let catalog = sample();
        let page = catalog.search("skills", "RUST", Page::default()).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].id, "rust-review");
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn unknown_collection_errors() {
        let err = sample().list("nope", Page::default()).await.unwrap_err();
        assert!(err.to_string().contains("unknown collection"));
    }

    #[test]
    fn load_yaml_and_json() {
        let dir = tempfile::tempdir().unwrap();

        let yaml = dir.path().join("catalog.yaml");
        std::fs::write(
            &yaml,
            "skills:\n  - id: a\n    name: A\n    description: first\n    level: 2\n",
        )
        .unwrap();
        let catalog = MemoryCatalog::load(&yaml).unwrap();
        assert_eq!(catalog.collections(), vec!["skills"]);
        assert_eq!(catalog.collections["skills"][0].extra["level"], 2);

        let json = dir.path().join("catalog.json");
        std::fs::write(&json, r#"{"mcps": [{"id": "x", "name": "X"}]}"#).unwrap();
        let catalog = MemoryCatalog::load(&json).unwrap();
        assert_eq!(catalog.collections["mcps"][0].description, "");
    }
}
