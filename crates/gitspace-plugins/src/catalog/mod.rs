//! Remote catalog index of installable plugins and templates.
//!
//! The catalog is a `gitspace-catalog.toml` document at the root of a
//! well-known repository. Each entry points at a directory inside that
//! repository holding a plugin manifest and its sources.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ManifestError;

/// File name of the catalog index at the catalog repository root.
pub const CATALOG_FILE_NAME: &str = "gitspace-catalog.toml";

/// Reference scheme selecting a catalog plugin, e.g. `catalog://hello`.
pub const CATALOG_SCHEME: &str = "catalog://";

/// Where the catalog repository lives and how to address its raw files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogLocation {
    /// Repository owner.
    pub owner: String,
    /// Repository name.
    pub repo: String,
    /// Branch the raw files are read from.
    pub branch: String,
    /// Base URL of the raw file host.
    pub raw_base_url: String,
}

impl CatalogLocation {
    /// Returns the raw URL of `path` inside the catalog repository.
    #[must_use]
    pub fn raw_url(&self, path: &str) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.raw_base_url.trim_end_matches('/'),
            self.owner,
            self.repo,
            self.branch,
            path.trim_start_matches('/')
        )
    }

    /// Returns the raw URL of the catalog index.
    #[must_use]
    pub fn index_url(&self) -> String {
        self.raw_url(CATALOG_FILE_NAME)
    }
}

impl Default for CatalogLocation {
    fn default() -> Self {
        Self {
            owner: String::from("ssotops"),
            repo: String::from("gitspace-catalog"),
            branch: String::from("master"),
            raw_base_url: String::from("https://raw.githubusercontent.com"),
        }
    }
}

/// Versioned index of installable plugins and templates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogIndex {
    /// Catalog-level metadata.
    #[serde(default)]
    pub catalog: CatalogInfo,
    /// Installable plugins keyed by name.
    #[serde(default)]
    pub plugins: BTreeMap<String, CatalogEntry>,
    /// Project templates keyed by name.
    #[serde(default)]
    pub templates: BTreeMap<String, CatalogEntry>,
}

impl CatalogIndex {
    /// Looks up a plugin entry by name.
    #[must_use]
    pub fn plugin(&self, name: &str) -> Option<&CatalogEntry> {
        self.plugins.get(name)
    }

    /// Returns `catalog://` references for every installable plugin.
    #[must_use]
    pub fn plugin_references(&self) -> Vec<String> {
        self.installable_plugins()
            .map(|(reference, _)| reference)
            .collect()
    }

    /// Yields each installable plugin with its `catalog://` reference, in
    /// name order. Entries without a usable `path` are skipped.
    pub fn installable_plugins(&self) -> impl Iterator<Item = (String, &CatalogEntry)> + '_ {
        self.plugins
            .iter()
            .filter(|(_, entry)| entry.is_installable())
            .map(|(name, entry)| (format!("{CATALOG_SCHEME}{name}"), entry))
    }
}

/// Catalog identity and freshness information.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogInfo {
    /// Catalog name.
    #[serde(default)]
    pub name: String,
    /// Catalog description.
    #[serde(default)]
    pub description: String,
    /// Catalog format or content version.
    #[serde(default)]
    pub version: String,
    /// When and at which commit the catalog was last regenerated.
    #[serde(default)]
    pub last_updated: LastUpdated,
}

/// Catalog regeneration stamp.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastUpdated {
    /// Date of the last update.
    #[serde(default)]
    pub date: String,
    /// Commit hash of the last update.
    #[serde(default)]
    pub commit_hash: String,
}

/// A plugin or template listed in the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Directory of the entry relative to the catalog repository root.
    #[serde(default)]
    pub path: String,
    /// Advertised version.
    #[serde(default)]
    pub version: String,
    /// Short description.
    #[serde(default)]
    pub description: String,
    /// Upstream repository of the entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<CatalogRepository>,
}

impl CatalogEntry {
    /// Returns `true` when the entry names a directory that can be fetched.
    #[must_use]
    pub fn is_installable(&self) -> bool {
        !self.path.trim().trim_matches('/').is_empty()
    }
}

/// Upstream repository of a catalog entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRepository {
    /// Repository kind, e.g. `git`.
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Repository URL.
    #[serde(default)]
    pub url: String,
}

/// Decodes a catalog index document.
///
/// # Errors
///
/// Returns [`ManifestError::Malformed`] when the bytes are not a decodable
/// catalog document.
pub fn parse_catalog(bytes: &[u8]) -> Result<CatalogIndex, ManifestError> {
    let text = std::str::from_utf8(bytes).map_err(|error| ManifestError::Malformed {
        message: format!("catalog is not valid UTF-8: {error}"),
    })?;
    toml::from_str(text).map_err(|error| ManifestError::Malformed {
        message: error.message().to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const CATALOG: &str = r#"
[catalog]
name = "Gitspace Catalog"
description = "Official plugins"
version = "1.0.0"

[catalog.last_updated]
date = "2024-07-01"
commit_hash = "abc123"

[plugins.hello]
path = "plugins/hello"
version = "1.0.0"
description = "Says hello"

[plugins.hello.repository]
type = "git"
url = "https://github.com/ssotops/gitspace-catalog"

[plugins.placeholder]
version = "0.0.1"

[templates.basic]
path = "templates/basic"
"#;

    #[test]
    fn parses_catalog_sections() {
        let index = parse_catalog(CATALOG.as_bytes()).expect("parse");
        assert_eq!(index.catalog.name, "Gitspace Catalog");
        assert_eq!(index.catalog.last_updated.commit_hash, "abc123");
        let hello = index.plugin("hello").expect("hello entry");
        assert_eq!(hello.path, "plugins/hello");
        assert_eq!(
            hello.repository.as_ref().map(|repo| repo.kind.as_str()),
            Some("git")
        );
        assert!(index.templates.contains_key("basic"));
    }

    #[test]
    fn references_skip_entries_without_path() {
        let index = parse_catalog(CATALOG.as_bytes()).expect("parse");
        assert_eq!(index.plugin_references(), vec!["catalog://hello"]);
    }

    #[test]
    fn installable_plugins_carry_their_entries() {
        let index = parse_catalog(CATALOG.as_bytes()).expect("parse");

        let listed: Vec<_> = index
            .installable_plugins()
            .map(|(reference, entry)| (reference, entry.version.as_str()))
            .collect();

        assert_eq!(listed, vec![(String::from("catalog://hello"), "1.0.0")]);
    }

    #[rstest]
    #[case::empty("", false)]
    #[case::slash_only("/", false)]
    #[case::nested("plugins/hello", true)]
    fn installable_requires_a_path(#[case] path: &str, #[case] expected: bool) {
        let entry = CatalogEntry {
            path: path.to_owned(),
            ..CatalogEntry::default()
        };
        assert_eq!(entry.is_installable(), expected);
    }

    #[test]
    fn default_location_points_at_public_catalog() {
        let location = CatalogLocation::default();
        assert_eq!(
            location.index_url(),
            "https://raw.githubusercontent.com/ssotops/gitspace-catalog/master/gitspace-catalog.toml"
        );
    }

    #[test]
    fn raw_urls_tolerate_stray_slashes() {
        let location = CatalogLocation {
            raw_base_url: String::from("http://localhost:8080/"),
            ..CatalogLocation::default()
        };
        assert_eq!(
            location.raw_url("/plugins/hello/main"),
            "http://localhost:8080/ssotops/gitspace-catalog/master/plugins/hello/main"
        );
    }

    #[test]
    fn empty_document_is_an_empty_catalog() {
        let index = parse_catalog(b"").expect("parse");
        assert!(index.plugins.is_empty());
    }

    #[test]
    fn malformed_catalog_is_rejected() {
        let error = parse_catalog(b"[plugins.hello\npath = 1").expect_err("must fail");
        assert!(matches!(error, ManifestError::Malformed { .. }));
    }
}
