//! Named key file maintenance for `mcp-hub keys`

use std::collections::BTreeMap;
use std::path::Path;

use rand::RngExt;
use serde_json::Value;

use super::DEFAULT_KEY_NAME;
use crate::{Error, Result};

/// Generate a new API key.
///
/// Format: `mal_<32-char URL-safe base64>` (192 bits of entropy).
#[must_use]
pub fn generate_key() -> String {
    let random_bytes: [u8; 24] = rand::rng().random();
    format!(
        "mal_{}",
        base64::Engine::encode(
            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
            random_bytes,
        )
    )
}

/// Mask a key for display: first 8 chars, an ellipsis, last 4.
#[must_use]
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 12 {
        return "****".to_string();
    }
    let head: String = chars[..8].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}…{tail}")
}

/// Read a key file as named keys.
///
/// A missing file is an empty set. Older array files are migrated to
/// `user-<i>` names and unstructured content becomes a single `default` key,
/// so the next [`save_key_file`] writes the named form.
pub fn load_key_file(path: &Path) -> Result<BTreeMap<String, String>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e.into()),
    };

    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(BTreeMap::new());
    }

    let keys = match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => map
            .into_iter()
            .map(|(name, value)| match value {
                Value::String(key) => Ok((name, key)),
                other => Err(Error::KeySource(format!(
                    "key {name} in {} is not a string: {other}",
                    path.display()
                ))),
            })
            .collect::<Result<_>>()?,
        Ok(Value::Array(items)) => items
            .into_iter()
            .enumerate()
            .filter_map(|(i, value)| match value {
                Value::String(key) => Some((format!("user-{i}"), key)),
                _ => None,
            })
            .collect(),
        _ => BTreeMap::from([(DEFAULT_KEY_NAME.to_string(), trimmed.to_string())]),
    };

    Ok(keys)
}

/// Write named keys as a pretty-printed JSON object
pub fn save_key_file(path: &Path, keys: &BTreeMap<String, String>) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut payload = serde_json::to_string_pretty(keys)?;
    payload.push('\n');
    std::fs::write(path, payload)?;
    Ok(())
}
