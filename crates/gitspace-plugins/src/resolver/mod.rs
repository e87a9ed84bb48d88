//! Turns a plugin reference into a staged source directory.
//!
//! Three reference forms are understood:
//!
//! - `catalog://<name>` downloads the plugin's manifest and declared files
//!   from the catalog repository into a fresh staging directory;
//! - `http://…` and `https://…` clone a repository into a staging directory;
//! - anything else is a local directory, or a local manifest file whose parent
//!   is the source root.
//!
//! Staging directories belong to the returned [`StagedSource`] and disappear
//! when it is dropped.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use tracing::{debug, info};

use crate::catalog::{CATALOG_SCHEME, CatalogIndex, CatalogLocation};
use crate::error::ResolveError;
use crate::fetch::SourceFetcher;
use crate::manifest::{MANIFEST_EXTENSION, MANIFEST_FILE_NAME, load_manifest};

/// Log target for resolver operations.
const RESOLVER_TARGET: &str = "gitspace_plugins::resolver";

/// Prefix of every staging directory.
pub const STAGING_PREFIX: &str = "gitspace-plugin-";

/// A plugin source ready for installation.
#[derive(Debug)]
pub struct StagedSource {
    root: PathBuf,
    manifest_path: PathBuf,
    staging: Option<TempDir>,
}

impl StagedSource {
    /// Returns the directory that declared source paths are relative to.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the manifest file.
    #[must_use]
    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    /// Returns `true` when the source lives in a temporary staging directory.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        self.staging.is_some()
    }

    /// Uses a local plugin directory, or a local manifest file whose parent
    /// is the source root, in place.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::InvalidLocalSource`] when `path` is neither.
    pub fn from_local(path: &Path) -> Result<Self, ResolveError> {
        resolve_local(path)
    }
}

/// Resolves plugin references through a [`SourceFetcher`].
#[derive(Debug)]
pub struct SourceResolver<F> {
    fetcher: F,
    catalog: CatalogLocation,
    staging_parent: Option<PathBuf>,
}

impl<F: SourceFetcher> SourceResolver<F> {
    /// Creates a resolver reading the catalog at `catalog`.
    #[must_use]
    pub const fn new(fetcher: F, catalog: CatalogLocation) -> Self {
        Self {
            fetcher,
            catalog,
            staging_parent: None,
        }
    }

    /// Creates staging directories under `parent` instead of the system
    /// temporary directory.
    #[must_use]
    pub fn with_staging_dir(mut self, parent: impl Into<PathBuf>) -> Self {
        self.staging_parent = Some(parent.into());
        self
    }

    /// Fetches the catalog index.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::CatalogUnavailable`] if the index cannot be
    /// fetched or decoded.
    pub fn catalog(&self) -> Result<CatalogIndex, ResolveError> {
        self.fetcher
            .fetch_catalog_index(&self.catalog.owner, &self.catalog.repo)
            .map_err(|error| ResolveError::CatalogUnavailable {
                owner: self.catalog.owner.clone(),
                repo: self.catalog.repo.clone(),
                message: error.to_string(),
            })
    }

    /// Resolves `reference` into a staged source.
    ///
    /// # Errors
    ///
    /// Returns the [`ResolveError`] matching the reference form: catalog
    /// lookups, downloads, clones, and local path checks each have their own
    /// variant.
    pub fn resolve(&self, reference: &str) -> Result<StagedSource, ResolveError> {
        if let Some(name) = reference.strip_prefix(CATALOG_SCHEME) {
            return self.resolve_catalog(name);
        }
        if reference.starts_with("http://") || reference.starts_with("https://") {
            return self.resolve_repository(reference);
        }
        StagedSource::from_local(Path::new(reference))
    }

    fn resolve_catalog(&self, name: &str) -> Result<StagedSource, ResolveError> {
        let index = self.catalog()?;
        let entry = index
            .plugin(name)
            .ok_or_else(|| ResolveError::NotFoundInCatalog {
                name: name.to_owned(),
                owner: self.catalog.owner.clone(),
                repo: self.catalog.repo.clone(),
            })?;
        if !entry.is_installable() {
            return Err(ResolveError::NotInstallable {
                name: name.to_owned(),
            });
        }
        let entry_path = entry.path.trim().trim_matches('/');

        let staging = self.staging_dir()?;
        let root = staging.path().to_path_buf();
        let manifest_path = root.join(MANIFEST_FILE_NAME);
        self.download(&format!("{entry_path}/{MANIFEST_FILE_NAME}"), &manifest_path)?;

        // Validation rejects any declared path that would leave the staging root.
        let manifest = load_manifest(&manifest_path)?;
        for source in manifest.sources() {
            let relative = url_path(source.path());
            self.download(&format!("{entry_path}/{relative}"), &root.join(source.path()))?;
        }

        info!(
            target: RESOLVER_TARGET,
            plugin = name,
            files = manifest.sources().len(),
            "staged catalog plugin"
        );
        Ok(StagedSource {
            root,
            manifest_path,
            staging: Some(staging),
        })
    }

    fn resolve_repository(&self, url: &str) -> Result<StagedSource, ResolveError> {
        let staging = self.staging_dir()?;
        let root = staging.path().join("repository");
        self.fetcher
            .clone_repository(url, &root)
            .map_err(|error| ResolveError::CloneFailed {
                url: url.to_owned(),
                message: error.to_string(),
            })?;
        info!(target: RESOLVER_TARGET, url, "cloned plugin repository");
        Ok(StagedSource {
            manifest_path: root.join(MANIFEST_FILE_NAME),
            root,
            staging: Some(staging),
        })
    }

    fn download(&self, relative: &str, dest: &Path) -> Result<(), ResolveError> {
        let url = self.catalog.raw_url(relative);
        debug!(target: RESOLVER_TARGET, url = %url, dest = %dest.display(), "downloading");
        self.fetcher
            .download_file(&url, dest)
            .map_err(|error| ResolveError::DownloadFailed {
                url,
                message: error.to_string(),
            })
    }

    fn staging_dir(&self) -> Result<TempDir, ResolveError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(STAGING_PREFIX);
        let staging = match &self.staging_parent {
            Some(parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        };
        staging.map_err(|source| ResolveError::Staging {
            source: Arc::new(source),
        })
    }
}

fn resolve_local(reference: &Path) -> Result<StagedSource, ResolveError> {
    let invalid = |message: String| ResolveError::InvalidLocalSource {
        path: reference.to_path_buf(),
        message,
    };
    let path = std::path::absolute(reference).map_err(|error| invalid(error.to_string()))?;

    if path.is_dir() {
        return Ok(StagedSource {
            manifest_path: path.join(MANIFEST_FILE_NAME),
            root: path,
            staging: None,
        });
    }
    let is_manifest = path
        .extension()
        .is_some_and(|extension| extension == MANIFEST_EXTENSION);
    if path.is_file() && is_manifest {
        let root = path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| invalid(String::from("manifest file has no parent directory")))?;
        return Ok(StagedSource {
            root,
            manifest_path: path,
            staging: None,
        });
    }
    if path.exists() {
        Err(invalid(String::from(
            "expected a plugin directory or a .toml manifest file",
        )))
    } else {
        Err(invalid(String::from("path does not exist")))
    }
}

/// Joins the normal components of a validated relative path with `/`.
fn url_path(path: &Path) -> String {
    path.components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
