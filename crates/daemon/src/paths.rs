use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// One prefix substitution between the catalog's view of a path and the
/// host filesystem's view of the same path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathMapping {
    pub catalog_prefix: String,
    pub host_prefix: String,
}

/// Translates paths between catalog space and host space using an ordered
/// list of prefix substitutions. The first matching mapping wins; paths that
/// match no mapping pass through unchanged.
#[derive(Debug, Clone, Default)]
pub struct PathMapper {
    mappings: Vec<PathMapping>,
}

impl PathMapper {
    /// Build a mapper from configured mappings. Trailing separators are
    /// stripped from both prefixes so that `/mnt/fast/` and `/mnt/fast`
    /// behave identically.
    pub fn new(mappings: &[PathMapping]) -> Self {
        let mappings = mappings
            .iter()
            .map(|m| PathMapping {
                catalog_prefix: normalize_prefix(&m.catalog_prefix),
                host_prefix: normalize_prefix(&m.host_prefix),
            })
            .collect();
        PathMapper { mappings }
    }

    /// Translate a catalog-reported path into the on-disk host path.
    pub fn to_host(&self, catalog_path: &str) -> PathBuf {
        for m in &self.mappings {
            if let Some(rest) = strip_prefix_on_boundary(catalog_path, &m.catalog_prefix) {
                return PathBuf::from(format!("{}{}", m.host_prefix, rest));
            }
        }
        PathBuf::from(catalog_path)
    }

    /// Translate an on-disk host path back into the catalog's path space.
    pub fn to_catalog(&self, host_path: &Path) -> String {
        let host_path = host_path.to_string_lossy();
        for m in &self.mappings {
            if let Some(rest) = strip_prefix_on_boundary(&host_path, &m.host_prefix) {
                return format!("{}{}", m.catalog_prefix, rest);
            }
        }
        host_path.into_owned()
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    // A bare "/" would otherwise normalize to the empty string and match
    // everything at offset zero.
    if trimmed.is_empty() && prefix.starts_with('/') {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Strip `prefix` from `path` only on a path-component boundary, so that
/// `/data/movies` never captures `/data/movies2`.
fn strip_prefix_on_boundary<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = path.strip_prefix(prefix)?;
    if rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/') {
        Some(rest)
    } else {
        None
    }
}
