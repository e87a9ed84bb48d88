//! Network collaborators used to obtain plugin sources.
//!
//! [`SourceFetcher`] is the seam between resolution logic and the outside
//! world. [`RemoteFetcher`] implements it with a blocking HTTP client for raw
//! catalog files and the system `git` binary for repository clones.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::catalog::{CatalogIndex, CatalogLocation, parse_catalog};
use crate::error::FetchError;

/// Log target for fetch operations.
const FETCH_TARGET: &str = "gitspace_plugins::fetch";

/// Retrieves catalog indexes, raw files, and repositories.
pub trait SourceFetcher: Send + Sync {
    /// Fetches and decodes the catalog index of `owner/repo`.
    ///
    /// # Errors
    ///
    /// Returns a [`FetchError`] if the index cannot be retrieved or decoded.
    fn fetch_catalog_index(&self, owner: &str, repo: &str) -> Result<CatalogIndex, FetchError>;

    /// Downloads `url` to `dest`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns a [`FetchError`] if the download or the write fails.
    fn download_file(&self, url: &str, dest: &Path) -> Result<(), FetchError>;

    /// Clones the repository at `url` into the empty directory `dest`.
    ///
    /// # Errors
    ///
    /// Returns a [`FetchError`] if the clone fails.
    fn clone_repository(&self, url: &str, dest: &Path) -> Result<(), FetchError>;
}

/// Fetches over HTTP(S) and clones with `git`.
#[derive(Debug, Clone)]
pub struct RemoteFetcher {
    client: reqwest::blocking::Client,
    raw_base_url: String,
    branch: String,
}

impl RemoteFetcher {
    /// Creates a fetcher whose catalog lookups use `location`'s raw host and
    /// branch, with every HTTP request bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Http`] if the HTTP client cannot be built.
    pub fn new(location: &CatalogLocation, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("gitspace/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|error| FetchError::Http {
                url: location.raw_base_url.clone(),
                message: error.to_string(),
            })?;
        Ok(Self {
            client,
            raw_base_url: location.raw_base_url.clone(),
            branch: location.branch.clone(),
        })
    }

    fn get(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        debug!(target: FETCH_TARGET, url, "GET");
        let response = self.client.get(url).send().map_err(|error| FetchError::Http {
            url: url.to_owned(),
            message: error.to_string(),
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_owned(),
                status: status.as_u16(),
            });
        }
        let body = response.bytes().map_err(|error| FetchError::Http {
            url: url.to_owned(),
            message: error.to_string(),
        })?;
        Ok(body.to_vec())
    }
}

impl SourceFetcher for RemoteFetcher {
    fn fetch_catalog_index(&self, owner: &str, repo: &str) -> Result<CatalogIndex, FetchError> {
        let location = CatalogLocation {
            owner: owner.to_owned(),
            repo: repo.to_owned(),
            branch: self.branch.clone(),
            raw_base_url: self.raw_base_url.clone(),
        };
        let body = self.get(&location.index_url())?;
        parse_catalog(&body).map_err(FetchError::Catalog)
    }

    fn download_file(&self, url: &str, dest: &Path) -> Result<(), FetchError> {
        let body = self.get(url)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|source| FetchError::Io {
                path: parent.to_path_buf(),
                source: Arc::new(source),
            })?;
        }
        fs::write(dest, body).map_err(|source| FetchError::Io {
            path: dest.to_path_buf(),
            source: Arc::new(source),
        })
    }

    fn clone_repository(&self, url: &str, dest: &Path) -> Result<(), FetchError> {
        debug!(target: FETCH_TARGET, url, dest = %dest.display(), "cloning repository");
        let output = Command::new("git")
            .args(["clone", "--depth", "1", "--quiet", url])
            .arg(dest)
            .output()
            .map_err(|source| FetchError::Io {
                path: PathBuf::from("git"),
                source: Arc::new(source),
            })?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        Err(FetchError::Git {
            url: url.to_owned(),
            message: if stderr.is_empty() {
                format!("git exited with {}", output.status)
            } else {
                stderr
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use tempfile::TempDir;

    use super::*;

    #[rstest]
    fn builds_with_default_location() {
        let fetcher =
            RemoteFetcher::new(&CatalogLocation::default(), Duration::from_secs(1)).expect("client");
        assert_eq!(fetcher.branch, "master");
    }

    #[rstest]
    fn unreachable_host_is_an_http_error() {
        let location = CatalogLocation {
            raw_base_url: String::from("http://127.0.0.1:9"),
            ..CatalogLocation::default()
        };
        let fetcher = RemoteFetcher::new(&location, Duration::from_millis(500)).expect("client");
        let error = fetcher
            .fetch_catalog_index("ssotops", "gitspace-catalog")
            .expect_err("must fail");
        assert!(matches!(error, FetchError::Http { .. }), "got {error}");
    }

    #[rstest]
    fn clone_of_missing_repository_fails() {
        let dir = TempDir::new().expect("temp dir");
        let fetcher =
            RemoteFetcher::new(&CatalogLocation::default(), Duration::from_secs(1)).expect("client");
        let missing = dir.path().join("no-such-repo");
        let error = fetcher
            .clone_repository(&missing.display().to_string(), &dir.path().join("clone"))
            .expect_err("must fail");
        assert!(
            matches!(error, FetchError::Git { .. } | FetchError::Io { .. }),
            "got {error}"
        );
    }
}
