//! Tool handlers attached to every engine
//!
//! Handlers render markdown. A handler error becomes a tool result with
//! `isError: true`; it never turns into a JSON-RPC error.

use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::catalog::{Catalog, CatalogEntry, Page};
use crate::protocol::{Tool, ToolAnnotations};
use crate::{Error, Result};

/// Per-call view of the owning session
#[derive(Debug, Clone, Copy)]
pub struct ToolContext<'a> {
    /// Session the call belongs to (`None` over stdio)
    pub session_id: Option<&'a str>,
    /// Tool calls handled by this session, including this one
    pub call_count: u64,
}

/// A tool exposed through `tools/list` and `tools/call`
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Definition advertised to clients
    fn definition(&self) -> Tool;

    /// Run the tool and render its output
    async fn call(&self, ctx: ToolContext<'_>, arguments: Value) -> Result<String>;
}

/// Build the full tool set for one session
pub(crate) fn session_tools(catalog: &Arc<dyn Catalog>) -> Vec<Box<dyn ToolHandler>> {
    vec![
        Box::new(CatalogSearch {
            catalog: Arc::clone(catalog),
        }),
        Box::new(CatalogGet {
            catalog: Arc::clone(catalog),
        }),
        Box::new(CatalogList {
            catalog: Arc::clone(catalog),
        }),
        Box::new(SessionInfo),
    ]
}

fn parse_args<T: DeserializeOwned>(arguments: Value) -> Result<T> {
    // Clients may omit `arguments` entirely for tools without required fields
    let arguments = if arguments.is_null() { json!({}) } else { arguments };
    serde_json::from_value(arguments).map_err(|e| Error::Protocol(format!("Invalid arguments: {e}")))
}

fn read_only_tool(name: &str, title: &str, description: &str, input_schema: Value) -> Tool {
    Tool {
        name: name.to_string(),
        title: Some(title.to_string()),
        description: Some(description.to_string()),
        input_schema,
        annotations: Some(ToolAnnotations::read_only()),
    }
}

fn entry_summary(entry: &CatalogEntry) -> String {
    if entry.description.is_empty() {
        format!("**{}** (`{}`)", entry.name, entry.id)
    } else {
        format!("**{}** (`{}`): {}", entry.name, entry.id, entry.description)
    }
}

// ----------------------------------------------------------------------------
// catalog_search
// ----------------------------------------------------------------------------

#[derive(Deserialize)]
struct SearchArgs {
    query: String,
    collection: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

struct CatalogSearch {
    catalog: Arc<dyn Catalog>,
}

#[async_trait]
impl ToolHandler for CatalogSearch {
    fn definition(&self) -> Tool {
        read_only_tool(
            "catalog_search",
            "Search Catalog",
            "Case-insensitive search across catalog collections (skills, commands, subagents, mcps)",
            json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Search text"},
                    "collection": {"type": "string", "description": "Limit search to one collection"},
                    "limit": {"type": "integer", "minimum": 1, "maximum": 100, "description": "Max results per collection (default 20)"},
                    "offset": {"type": "integer", "minimum": 0, "description": "Pagination offset"}
                },
                "required": ["query"]
            }),
        )
    }

    async fn call(&self, _ctx: ToolContext<'_>, arguments: Value) -> Result<String> {
        let args: SearchArgs = parse_args(arguments)?;
        let page = Page::new(args.limit, args.offset);
        let collections = match args.collection {
            Some(c) => vec![c],
            None => self.catalog.collections(),
        };

        let mut lines = Vec::new();
        for collection in &collections {
            let hits = self.catalog.search(collection, &args.query, page).await?;
            lines.extend(
                hits.items
                    .iter()
                    .map(|e| format!("- [{collection}] {}", entry_summary(e))),
            );
        }

        if lines.is_empty() {
            return Ok(format!(
                "No results found for '{}'. Try broader search terms.",
                args.query
            ));
        }

        Ok(format!(
            "## Catalog Search: '{}'\n\n{}\n\n*{} total results*",
            args.query,
            lines.join("\n"),
            lines.len()
        ))
    }
}

// ----------------------------------------------------------------------------
// catalog_get
// ----------------------------------------------------------------------------

#[derive(Deserialize)]
struct GetArgs {
    collection: String,
    id: String,
}

struct CatalogGet {
    catalog: Arc<dyn Catalog>,
}

#[async_trait]
impl ToolHandler for CatalogGet {
    fn definition(&self) -> Tool {
        read_only_tool(
            "catalog_get",
            "Get Catalog Entry",
            "Fetch one catalog entry by collection and id",
            json!({
                "type": "object",
                "properties": {
                    "collection": {"type": "string"},
                    "id": {"type": "string"}
                },
                "required": ["collection", "id"]
            }),
        )
    }

    async fn call(&self, _ctx: ToolContext<'_>, arguments: Value) -> Result<String> {
        let args: GetArgs = parse_args(arguments)?;
        let entry = self
            .catalog
            .get(&args.collection, &args.id)
            .await?
            .ok_or_else(|| {
                Error::Catalog(format!("'{}' not found in {}", args.id, args.collection))
            })?;

        let mut out = format!(
            "## {}\n\n**ID:** `{}`\n**Collection:** {}\n",
            entry.name, entry.id, args.collection
        );
        if !entry.tags.is_empty() {
            let _ = writeln!(out, "**Tags:** {}", entry.tags.join(", "));
        }
        if !entry.description.is_empty() {
            let _ = write!(out, "\n{}\n", entry.description);
        }
        if !entry.extra.is_empty() {
            let details = serde_json::to_string_pretty(&entry.extra)?;
            let _ = write!(out, "\n```json\n{details}\n```\n");
        }
        Ok(out)
    }
}

// ----------------------------------------------------------------------------
// catalog_list
// ----------------------------------------------------------------------------

#[derive(Deserialize)]
struct ListArgs {
    collection: String,
    limit: Option<usize>,
    offset: Option<usize>,
}

struct CatalogList {
    catalog: Arc<dyn Catalog>,
}

#[async_trait]
impl ToolHandler for CatalogList {
    fn definition(&self) -> Tool {
        read_only_tool(
            "catalog_list",
            "List Catalog Collection",
            "List the entries of one catalog collection, paginated",
            json!({
                "type": "object",
                "properties": {
                    "collection": {"type": "string"},
                    "limit": {"type": "integer", "minimum": 1, "maximum": 100},
                    "offset": {"type": "integer", "minimum": 0}
                },
                "required": ["collection"]
            }),
        )
    }

    async fn call(&self, _ctx: ToolContext<'_>, arguments: Value) -> Result<String> {
        let args: ListArgs = parse_args(arguments)?;
        let page = Page::new(args.limit, args.offset);
        let result = self.catalog.list(&args.collection, page).await?;

        if result.items.is_empty() {
            return Ok(format!("No entries in {} at offset {}.", args.collection, page.offset));
        }

        let lines: Vec<String> = result
            .items
            .iter()
            .map(|e| format!("- {}", entry_summary(e)))
            .collect();
        let mut out = format!(
            "## {} ({} total)\n\n{}\n\n*Showing {}-{} of {}*",
            args.collection,
            result.total,
            lines.join("\n"),
            page.offset + 1,
            page.offset + result.items.len(),
            result.total
        );
        if result.has_more {
            let _ = write!(
                out,
                "\n\nMore available: call again with offset={}",
                page.offset + result.items.len()
            );
        }
        Ok(out)
    }
}

// ----------------------------------------------------------------------------
// session_info
// ----------------------------------------------------------------------------

struct SessionInfo;

#[async_trait]
impl ToolHandler for SessionInfo {
    fn definition(&self) -> Tool {
        read_only_tool(
            "session_info",
            "Session Info",
            "Report this session's id and how many tool calls it has handled",
            json!({"type": "object", "properties": {}}),
        )
    }

    async fn call(&self, ctx: ToolContext<'_>, _arguments: Value) -> Result<String> {
        Ok(format!(
            "## Session\n\n**ID:** {}\n**Tool calls:** {}",
            ctx.session_id.unwrap_or("(stdio)"),
            ctx.call_count
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::catalog::MemoryCatalog;

    fn catalog() -> Arc<dyn Catalog> {
        let entry = |id: &str, name: &str| CatalogEntry {
            id: id.to_string(),
            name: name.to_string(),
            description: format!("{name} description"),
            tags: vec!["dev".to_string()],
            extra: serde_json::Map::new(),
        };
        let mut catalog = MemoryCatalog::new();
        for i in 0..25 {
            catalog = catalog.with_entry("skills", entry(&format!("skill-{i}"), &format!("Skill {i}")));
        }
        Arc::new(catalog.with_entry("commands", entry("deploy", "Deploy")))
    }

    fn tool(name: &str) -> Box<dyn ToolHandler> {
        session_tools(&catalog())
            .into_iter()
            .find(|t| t.definition().name == name)
            .unwrap()
    }

    const CTX: ToolContext<'static> = ToolContext {
        session_id: Some("abc"),
        call_count: 3,
    };

    #[test]
    fn all_tools_are_read_only() {
        for handler in session_tools(&catalog()) {
            let def = handler.definition();
            assert_eq!(def.annotations.unwrap().read_only_hint, Some(true), "{}", def.name);
            assert_eq!(def.input_schema["type"], "object");
        }
    }

    #[tokio::test]
    async fn search_across_collections() {
        let out = tool("catalog_search")
            .call(CTX, json!({"query": "deploy"}))
            .await
            .unwrap();
        assert!(out.contains("[commands] **Deploy**"));
        assert!(out.contains("*1 total results*"));
    }

    #[tokio::test]
    async fn search_without_hits() {
        let out = tool("catalog_search")
            .call(CTX, json!({"query": "zzz"}))
            .await
            .unwrap();
        assert!(out.starts_with("No results found for 'zzz'"));
    }

    #[tokio::test]
    async fn search_requires_query() {
        let err = tool("catalog_search").call(CTX, json!({})).await.unwrap_err();
        assert!(err.to_string().contains("Invalid arguments"));
    }

    #[tokio::test]
    async fn list_paginates_with_default_limit() {
        let out = tool("catalog_list")
            .call(CTX, json!({"collection": "skills"}))
            .await
            .unwrap();
        assert!(out.contains("## skills (25 total)"));
        assert!(out.contains("*Showing 1-20 of 25*"));
        assert!(out.contains("offset=20"));

        let out = tool("catalog_list")
            .call(CTX, json!({"collection": "skills", "offset": 20}))
            .await
            .unwrap();
        assert!(out.contains("*Showing 21-25 of 25*"));
        assert!(!out.contains("More available"));
    }

    #[tokio::test]
    async fn get_renders_entry_or_fails() {
        let get = tool("catalog_get");
        let out = get
            .call(CTX, json!({"collection": "commands", "id": "deploy"}))
            .await
            .unwrap();
        assert!(out.starts_with("## Deploy"));
        assert!(out.contains("**Tags:** dev"));

        let err = get
            .call(CTX, json!({"collection": "commands", "id": "nope"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn session_info_reports_context() {
        let out = tool("session_info").call(CTX, Value::Null).await.unwrap();
        assert!(out.contains("**ID:** abc"));
        assert!(out.contains("**Tool calls:** 3"));
    }
}
