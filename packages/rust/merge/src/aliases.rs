//! Known-alias table.
//!
//! A TOML file mapping each canonical name to its aliases:
//!
//! ```toml
//! "王林" = ["铁柱", "王师弟"]
//! "司徒南" = ["老鬼"]
//! ```
//!
//! Entries here always win over aliases reported by the extractor.

use std::collections::BTreeMap;
use std::path::Path;

use novelkb_shared::{NovelKbError, Result};

use crate::normalize::normalize_name;

#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    /// Normalized alias (or canonical) → canonical display name.
    names: BTreeMap<String, String>,
}

impl AliasTable {
    pub fn parse(source: &str) -> Result<Self> {
        let raw: BTreeMap<String, Vec<String>> = toml::from_str(source)
            .map_err(|e| NovelKbError::config(format!("invalid alias table: {e}")))?;

        let mut names = BTreeMap::new();
        for (canonical, aliases) in &raw {
            let canonical = canonical.trim();
            let key = normalize_name(canonical);
            if key.is_empty() {
                return Err(NovelKbError::config("alias table has an empty canonical name"));
            }
            insert(&mut names, key, canonical)?;
            for alias in aliases {
                let alias_key = normalize_name(alias);
                if alias_key.is_empty() || alias_key == normalize_name(canonical) {
                    continue;
                }
                insert(&mut names, alias_key, canonical)?;
            }
        }

        Ok(Self { names })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path).map_err(|e| NovelKbError::io(path, e))?;
        Self::parse(&source)
    }

    /// Canonical display name for a normalized key, if the table knows it.
    pub fn canonical(&self, key: &str) -> Option<&str> {
        self.names.get(key).map(String::as_str)
    }
}

fn insert(names: &mut BTreeMap<String, String>, key: String, canonical: &str) -> Result<()> {
    match names.get(&key) {
        Some(existing) if existing != canonical => Err(NovelKbError::config(format!(
            "alias table maps '{key}' to both '{existing}' and '{canonical}'"
        ))),
        _ => {
            names.insert(key, canonical.to_string());
            Ok(())
        }
    }
}
