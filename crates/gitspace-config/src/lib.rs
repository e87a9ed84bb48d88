//! Shared configuration for the `gitspace` binaries.
//!
//! Settings are layered by `ortho_config`, lowest precedence first: built-in
//! defaults, a TOML configuration file, `GITSPACE_*` environment variables,
//! and command-line flags. The file is the one named by `--config-path` (or
//! `GITSPACE_CONFIG_PATH`), otherwise whatever `ortho_config` discovers for
//! the `gitspace` prefix.
//!
//! Loading only merges layers. Call [`Config::validate`] before handing the
//! result to the plugin subsystem.

mod defaults;
mod logging;

use std::ffi::OsString;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::defaults::{
    default_catalog_branch, default_catalog_owner, default_catalog_repo,
    default_handshake_timeout_ms, default_http_timeout_ms, default_install_lock_wait_ms,
    default_raw_base_url, default_request_timeout_ms, default_shutdown_grace_ms,
};
pub use crate::defaults::{
    DEFAULT_CATALOG_BRANCH, DEFAULT_CATALOG_OWNER, DEFAULT_CATALOG_REPO,
    DEFAULT_HANDSHAKE_TIMEOUT_MS, DEFAULT_HTTP_TIMEOUT_MS, DEFAULT_INSTALL_LOCK_WAIT_MS,
    DEFAULT_LOG_FILTER, DEFAULT_RAW_BASE_URL, DEFAULT_REQUEST_TIMEOUT_MS,
    DEFAULT_SHUTDOWN_GRACE_MS, default_log_filter, default_log_filter_string, default_log_format,
    default_plugins_dir,
};
pub use crate::logging::{LogFormat, LogFormatParseError};
pub use ortho_config::OrthoError;

/// A merged value that the plugin subsystem cannot work with.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A merged value is out of range.
    #[error("invalid configuration value for '{field}': {message}")]
    Invalid {
        /// Offending setting.
        field: &'static str,
        /// Why the value was rejected.
        message: String,
    },
}

/// Location of the plugin catalog repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogConfig {
    /// Repository owner.
    pub owner: String,
    /// Repository name.
    pub repo: String,
    /// Branch the index is read from.
    pub branch: String,
    /// Host serving raw repository files.
    pub raw_base_url: String,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            owner: default_catalog_owner(),
            repo: default_catalog_repo(),
            branch: default_catalog_branch(),
            raw_base_url: default_raw_base_url(),
        }
    }
}

/// Fully merged configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, OrthoConfig)]
#[ortho_config(prefix = "GITSPACE")]
pub struct Config {
    /// Directory holding installed plugins.
    #[serde(default = "default_plugins_dir")]
    #[ortho_config(default = default_plugins_dir())]
    plugins_dir: Utf8PathBuf,

    /// Parent directory for temporary staging directories.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    staging_dir: Option<Utf8PathBuf>,

    /// Owner of the catalog repository.
    #[serde(default = "default_catalog_owner")]
    #[ortho_config(default = default_catalog_owner())]
    catalog_owner: String,

    /// Name of the catalog repository.
    #[serde(default = "default_catalog_repo")]
    #[ortho_config(default = default_catalog_repo())]
    catalog_repo: String,

    /// Branch the catalog is read from.
    #[serde(default = "default_catalog_branch")]
    #[ortho_config(default = default_catalog_branch())]
    catalog_branch: String,

    /// Host serving raw repository files.
    #[serde(default = "default_raw_base_url")]
    #[ortho_config(default = default_raw_base_url())]
    catalog_raw_base_url: String,

    /// Handshake timeout in milliseconds.
    #[serde(default = "default_handshake_timeout_ms")]
    #[ortho_config(default = DEFAULT_HANDSHAKE_TIMEOUT_MS)]
    handshake_timeout_ms: u64,

    /// Request timeout in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    #[ortho_config(default = DEFAULT_REQUEST_TIMEOUT_MS)]
    request_timeout_ms: u64,

    /// Grace period before a plugin is killed, in milliseconds.
    #[serde(default = "default_shutdown_grace_ms")]
    #[ortho_config(default = DEFAULT_SHUTDOWN_GRACE_MS)]
    shutdown_grace_ms: u64,

    /// Wait for a contended install lock, in milliseconds.
    #[serde(default = "default_install_lock_wait_ms")]
    #[ortho_config(default = DEFAULT_INSTALL_LOCK_WAIT_MS)]
    install_lock_wait_ms: u64,

    /// HTTP request timeout in milliseconds.
    #[serde(default = "default_http_timeout_ms")]
    #[ortho_config(default = DEFAULT_HTTP_TIMEOUT_MS)]
    http_timeout_ms: u64,

    /// Log filter expression, e.g. `info` or `gitspace_plugins=debug`.
    #[serde(default = "default_log_filter_string")]
    #[ortho_config(default = default_log_filter_string())]
    log_filter: String,

    /// Log output format: `compact` or `json`.
    #[serde(default = "default_log_format")]
    #[ortho_config(default = default_log_format())]
    log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            plugins_dir: default_plugins_dir(),
            staging_dir: None,
            catalog_owner: default_catalog_owner(),
            catalog_repo: default_catalog_repo(),
            catalog_branch: default_catalog_branch(),
            catalog_raw_base_url: default_raw_base_url(),
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            install_lock_wait_ms: DEFAULT_INSTALL_LOCK_WAIT_MS,
            http_timeout_ms: DEFAULT_HTTP_TIMEOUT_MS,
            log_filter: default_log_filter_string(),
            log_format: default_log_format(),
        }
    }
}

impl Config {
    /// Merges every layer using the process arguments.
    ///
    /// # Errors
    ///
    /// Returns the [`OrthoError`] raised by an unreadable or malformed file,
    /// an unparsable environment variable, or an unknown flag.
    pub fn load() -> Result<Self, Arc<OrthoError>> {
        <Self as OrthoConfig>::load()
    }

    /// Merges every layer, parsing `args` (program name first) as the
    /// command-line layer.
    ///
    /// # Errors
    ///
    /// As [`load`](Self::load).
    pub fn load_from_iter<I, T>(args: I) -> Result<Self, Arc<OrthoError>>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as OrthoConfig>::load_from_iter(args)
    }

    /// Rejects merged values the plugin subsystem cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.plugins_dir.as_str().trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "plugins_dir",
                message: String::from("must not be empty"),
            });
        }
        let timeouts = [
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("request_timeout_ms", self.request_timeout_ms),
            ("http_timeout_ms", self.http_timeout_ms),
        ];
        for (field, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    message: String::from("must be greater than zero"),
                });
            }
        }
        for (field, value) in [
            ("catalog_owner", &self.catalog_owner),
            ("catalog_repo", &self.catalog_repo),
            ("catalog_branch", &self.catalog_branch),
            ("catalog_raw_base_url", &self.catalog_raw_base_url),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field,
                    message: String::from("must not be empty"),
                });
            }
        }
        Ok(())
    }

    /// Directory holding installed plugins.
    #[must_use]
    pub const fn plugins_dir(&self) -> &Utf8PathBuf {
        &self.plugins_dir
    }

    /// Parent of temporary staging directories, when not the system default.
    #[must_use]
    pub const fn staging_dir(&self) -> Option<&Utf8PathBuf> {
        self.staging_dir.as_ref()
    }

    /// Catalog repository location.
    #[must_use]
    pub fn catalog(&self) -> CatalogConfig {
        CatalogConfig {
            owner: self.catalog_owner.clone(),
            repo: self.catalog_repo.clone(),
            branch: self.catalog_branch.clone(),
            raw_base_url: self.catalog_raw_base_url.clone(),
        }
    }

    /// Handshake timeout.
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Per-request timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Grace period before a plugin is killed.
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Wait for a contended install lock.
    #[must_use]
    pub const fn install_lock_wait(&self) -> Duration {
        Duration::from_millis(self.install_lock_wait_ms)
    }

    /// Timeout of each HTTP request.
    #[must_use]
    pub const fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    /// Log filter expression.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    /// Log output format.
    #[must_use]
    pub const fn log_format(&self) -> LogFormat {
        self.log_format
    }
}
