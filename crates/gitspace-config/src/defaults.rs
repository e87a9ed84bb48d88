use std::env;

use camino::Utf8PathBuf;
use dirs::home_dir;

/// Default log filter expression used by the binaries.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Owner of the default catalog repository.
pub const DEFAULT_CATALOG_OWNER: &str = "ssotops";

/// Name of the default catalog repository.
pub const DEFAULT_CATALOG_REPO: &str = "gitspace-catalog";

/// Branch the catalog is read from.
pub const DEFAULT_CATALOG_BRANCH: &str = "master";

/// Host serving raw repository files.
pub const DEFAULT_RAW_BASE_URL: &str = "https://raw.githubusercontent.com";

/// Milliseconds a freshly spawned plugin has to answer the handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 3_000;

/// Milliseconds a menu or command request may take.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Milliseconds a plugin has to exit after its stdin closes.
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2_000;

/// Milliseconds spent waiting for a contended install lock.
pub const DEFAULT_INSTALL_LOCK_WAIT_MS: u64 = 5_000;

/// Milliseconds an HTTP request to the catalog host may take.
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 30_000;

/// Default log filter expression used by the binaries.
#[must_use]
pub const fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

/// Owned log filter value used where allocation is required (e.g. serde).
#[must_use]
pub fn default_log_filter_string() -> String {
    DEFAULT_LOG_FILTER.to_owned()
}

/// Default logging format for the binaries.
#[must_use]
pub fn default_log_format() -> crate::logging::LogFormat {
    crate::logging::LogFormat::Compact
}

/// Computes the default plugins root, `~/.ssot/gitspace/plugins`.
///
/// Falls back to a directory under the system temporary directory when the
/// home directory is unknown or not valid UTF-8.
#[must_use]
pub fn default_plugins_dir() -> Utf8PathBuf {
    let base = home_dir()
        .and_then(|path| Utf8PathBuf::from_path_buf(path).ok())
        .unwrap_or_else(fallback_base_directory);
    base.join(".ssot").join("gitspace").join("plugins")
}

pub(crate) fn default_catalog_owner() -> String {
    DEFAULT_CATALOG_OWNER.to_owned()
}

pub(crate) fn default_catalog_repo() -> String {
    DEFAULT_CATALOG_REPO.to_owned()
}

pub(crate) fn default_catalog_branch() -> String {
    DEFAULT_CATALOG_BRANCH.to_owned()
}

pub(crate) fn default_raw_base_url() -> String {
    DEFAULT_RAW_BASE_URL.to_owned()
}

pub(crate) const fn default_handshake_timeout_ms() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT_MS
}

pub(crate) const fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

pub(crate) const fn default_shutdown_grace_ms() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_MS
}

pub(crate) const fn default_install_lock_wait_ms() -> u64 {
    DEFAULT_INSTALL_LOCK_WAIT_MS
}

pub(crate) const fn default_http_timeout_ms() -> u64 {
    DEFAULT_HTTP_TIMEOUT_MS
}

fn fallback_base_directory() -> Utf8PathBuf {
    let candidate = env::temp_dir();
    Utf8PathBuf::from_path_buf(candidate).unwrap_or_else(|_| Utf8PathBuf::from("/tmp"))
}
