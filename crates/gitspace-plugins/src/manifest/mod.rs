//! Plugin manifest types describing plugin identity and source files.
//!
//! A [`PluginManifest`] is the semantic content of a `gitspace-plugin.toml`
//! file: the plugin name and version, optional descriptive metadata, and the
//! ordered list of [`PluginSource`] files that make up the plugin. Parsing is
//! split from validation so a structurally broken document
//! ([`ManifestError::Malformed`]) is distinguishable from one that decodes but
//! breaks an invariant ([`ManifestError::Invalid`]).

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ManifestError;

/// File name of the manifest inside a plugin source or install directory.
pub const MANIFEST_FILE_NAME: &str = "gitspace-plugin.toml";

/// Extension identifying a manifest file passed directly as a local source.
pub const MANIFEST_EXTENSION: &str = "toml";

/// On-disk layout: all plugin metadata lives under a `[plugin]` table.
#[derive(Debug, Serialize, Deserialize)]
struct ManifestDocument {
    plugin: PluginManifest,
}

/// Declarative description of a plugin and the files it ships.
///
/// # Example
///
/// ```
/// use gitspace_plugins::{PluginManifest, PluginSource};
///
/// let manifest = PluginManifest::new(
///     "hello",
///     "1.0.0",
///     vec![PluginSource::new("main", "main")],
/// );
/// manifest.validate().expect("valid manifest");
/// assert_eq!(manifest.primary_source().map(|s| s.entry_point()), Some("main"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManifest {
    name: String,
    version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    author: Option<String>,
    #[serde(default)]
    sources: Vec<PluginSource>,
}

impl PluginManifest {
    /// Creates a manifest without description or author.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        sources: Vec<PluginSource>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: None,
            author: None,
            sources,
        }
    }

    /// Attaches a human-readable description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Attaches an author.
    #[must_use]
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    /// Returns the plugin name.
    #[must_use]
    pub const fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Returns the plugin version.
    #[must_use]
    pub const fn version(&self) -> &str {
        self.version.as_str()
    }

    /// Returns the description, when declared.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Returns the author, when declared.
    #[must_use]
    pub fn author(&self) -> Option<&str> {
        self.author.as_deref()
    }

    /// Returns the declared sources in manifest order.
    #[must_use]
    pub fn sources(&self) -> &[PluginSource] {
        &self.sources
    }

    /// Returns the source whose entry point launches the plugin.
    #[must_use]
    pub fn primary_source(&self) -> Option<&PluginSource> {
        self.sources.first()
    }

    /// Checks every manifest invariant.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::Invalid`] naming the first offending field
    /// when the name is not a plain directory name, the source list is empty,
    /// a source path is absolute or escapes the source root, or an entry
    /// point is empty or a relative path escaping the plugin directory.
    /// Absolute entry points and bare command names are left to the launcher.
    pub fn validate(&self) -> Result<(), ManifestError> {
        validate_name(&self.name)?;
        if self.sources.is_empty() {
            return Err(ManifestError::invalid(
                "sources",
                "at least one source must be declared",
            ));
        }
        for (index, source) in self.sources.iter().enumerate() {
            validate_relative_path(&source.path)
                .map_err(|message| ManifestError::invalid(format!("sources[{index}].path"), message))?;
            if source.entry_point.trim().is_empty() {
                return Err(ManifestError::invalid(
                    format!("sources[{index}].entry_point"),
                    "entry point must not be empty",
                ));
            }
            let entry = Path::new(&source.entry_point);
            let escapes = entry
                .components()
                .any(|component| component == Component::ParentDir);
            if entry.is_relative() && escapes {
                return Err(ManifestError::invalid(
                    format!("sources[{index}].entry_point"),
                    format!(
                        "entry point '{}' must not traverse outside the plugin directory",
                        source.entry_point
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Serialises the manifest back into its TOML document form.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::Malformed`] if the encoder rejects the value.
    pub fn to_toml_string(&self) -> Result<String, ManifestError> {
        let document = ManifestDocument {
            plugin: self.clone(),
        };
        toml::to_string(&document).map_err(|error| ManifestError::Malformed {
            message: error.to_string(),
        })
    }
}

/// One file shipped by a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginSource {
    path: PathBuf,
    entry_point: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    repository: Option<SourceRepository>,
}

impl PluginSource {
    /// Creates a source without repository origin.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, entry_point: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            entry_point: entry_point.into(),
            repository: None,
        }
    }

    /// Records where the source was obtained from.
    #[must_use]
    pub fn with_repository(mut self, repository: SourceRepository) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Returns the path relative to the plugin root.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the executable entry inside this source.
    #[must_use]
    pub const fn entry_point(&self) -> &str {
        self.entry_point.as_str()
    }

    /// Returns the repository origin, when declared.
    #[must_use]
    pub const fn repository(&self) -> Option<&SourceRepository> {
        self.repository.as_ref()
    }
}

/// Version-control origin of a source file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRepository {
    /// Repository kind, e.g. `git`.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Clone URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Branch the source was taken from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

/// Decodes and validates a manifest document.
///
/// # Errors
///
/// Returns [`ManifestError::Malformed`] when the bytes are not a decodable
/// manifest and [`ManifestError::Invalid`] when an invariant is violated.
pub fn parse_manifest(bytes: &[u8]) -> Result<PluginManifest, ManifestError> {
    let text = std::str::from_utf8(bytes).map_err(|error| ManifestError::Malformed {
        message: format!("manifest is not valid UTF-8: {error}"),
    })?;
    let document: ManifestDocument =
        toml::from_str(text).map_err(|error| ManifestError::Malformed {
            message: error.message().to_owned(),
        })?;
    document.plugin.validate()?;
    Ok(document.plugin)
}

/// Reads and parses the manifest at `path`.
///
/// # Errors
///
/// Returns [`ManifestError::Read`] if the file cannot be read, otherwise the
/// errors of [`parse_manifest`].
pub fn load_manifest(path: &Path) -> Result<PluginManifest, ManifestError> {
    let bytes = fs::read(path).map_err(|source| ManifestError::Read {
        path: path.to_path_buf(),
        source: Arc::new(source),
    })?;
    parse_manifest(&bytes)
}

fn validate_name(name: &str) -> Result<(), ManifestError> {
    if name.trim().is_empty() {
        return Err(ManifestError::invalid("name", "plugin name must not be empty"));
    }
    if name.starts_with('.') || name.contains(['/', '\\']) {
        return Err(ManifestError::invalid(
            "name",
            format!("plugin name '{name}' must be a plain directory name"),
        ));
    }
    Ok(())
}

/// Accepts only paths made of normal components below the source root.
pub(crate) fn validate_relative_path(path: &Path) -> Result<(), String> {
    let mut normal_components = 0_usize;
    for component in path.components() {
        match component {
            Component::Normal(_) => normal_components += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(format!(
                    "path '{}' must not traverse outside the source root",
                    path.display()
                ));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(format!("path '{}' must be relative", path.display()));
            }
        }
    }
    if normal_components == 0 {
        return Err(String::from("path must name a file"));
    }
    Ok(())
}
