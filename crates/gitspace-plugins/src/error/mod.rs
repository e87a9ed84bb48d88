//! Domain errors raised by the plugin host.
//!
//! Each stage of the pipeline has its own `thiserror`-derived enum so callers
//! can match on the failure kind and render a precise message from the
//! structured context (offending field, path, plugin name). I/O errors are
//! wrapped in `Arc` so errors stay cheap to clone when they are fanned out to
//! pending protocol requests.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Errors raised while parsing or validating manifests and catalog indexes.
#[derive(Debug, Clone, Error)]
pub enum ManifestError {
    /// The document could not be decoded at all.
    #[error("malformed manifest: {message}")]
    Malformed {
        /// Decoder diagnostic.
        message: String,
    },

    /// The document decoded but violates a manifest invariant.
    #[error("invalid manifest field '{field}': {message}")]
    Invalid {
        /// Name of the offending field, e.g. `sources[0].path`.
        field: String,
        /// Description of the violated invariant.
        message: String,
    },

    /// The manifest file could not be read from disk.
    #[error("failed to read manifest '{}': {source}", path.display())]
    Read {
        /// Path that was read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },
}

impl ManifestError {
    pub(crate) fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Errors raised by a [`SourceFetcher`](crate::fetch::SourceFetcher).
#[derive(Debug, Error)]
pub enum FetchError {
    /// The HTTP request could not be completed.
    #[error("request to '{url}' failed: {message}")]
    Http {
        /// Requested URL.
        url: String,
        /// Client diagnostic.
        message: String,
    },

    /// The server answered with a non-success status.
    #[error("'{url}' answered with HTTP status {status}")]
    Status {
        /// Requested URL.
        url: String,
        /// Response status code.
        status: u16,
    },

    /// The fetched catalog index could not be decoded.
    #[error("catalog index is unusable: {0}")]
    Catalog(#[source] ManifestError),

    /// `git clone` reported a failure.
    #[error("git clone of '{url}' failed: {message}")]
    Git {
        /// Repository URL.
        url: String,
        /// Trimmed stderr of the client.
        message: String,
    },

    /// A local filesystem or process operation failed.
    #[error("I/O error at '{}': {source}", path.display())]
    Io {
        /// Path being written or the program being run.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },
}

/// Errors raised while turning a plugin reference into a staged source.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The catalog does not list the requested plugin.
    #[error("plugin '{name}' not found in catalog {owner}/{repo}")]
    NotFoundInCatalog {
        /// Requested plugin name.
        name: String,
        /// Catalog repository owner.
        owner: String,
        /// Catalog repository name.
        repo: String,
    },

    /// The catalog lists the plugin without an installable path.
    #[error("catalog entry '{name}' has no installable path")]
    NotInstallable {
        /// Requested plugin name.
        name: String,
    },

    /// The catalog index could not be fetched or decoded.
    #[error("failed to fetch catalog {owner}/{repo}: {message}")]
    CatalogUnavailable {
        /// Catalog repository owner.
        owner: String,
        /// Catalog repository name.
        repo: String,
        /// Failure description.
        message: String,
    },

    /// Cloning a remote repository failed.
    #[error("failed to clone '{url}': {message}")]
    CloneFailed {
        /// Repository URL.
        url: String,
        /// Output or error reported by the version-control client.
        message: String,
    },

    /// A local reference is neither a directory nor a manifest file.
    #[error("invalid local plugin source '{}': {message}", path.display())]
    InvalidLocalSource {
        /// Path given by the operator.
        path: PathBuf,
        /// Why the path was rejected.
        message: String,
    },

    /// Downloading one of the catalog plugin files failed.
    #[error("failed to download '{url}': {message}")]
    DownloadFailed {
        /// URL of the file.
        url: String,
        /// Failure description.
        message: String,
    },

    /// A downloaded manifest was malformed or invalid.
    #[error("staged manifest rejected: {0}")]
    Manifest(#[from] ManifestError),

    /// The temporary staging directory could not be created.
    #[error("failed to create staging directory: {source}")]
    Staging {
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },
}

/// Errors raised while materialising a staged source into the plugins root.
#[derive(Debug, Error)]
pub enum InstallError {
    /// The staged manifest failed to parse or validate.
    #[error("cannot install: {0}")]
    ManifestInvalid(#[source] ManifestError),

    /// A previous install could not be removed.
    #[error("failed to remove existing plugin directory '{}': {source}", path.display())]
    CleanupFailed {
        /// Directory that could not be removed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// A source file declared by the manifest is absent from the staged root.
    #[error("declared source file '{}' is missing from the plugin source", path.display())]
    MissingSourceFile {
        /// Relative path declared in the manifest.
        path: PathBuf,
    },

    /// Another install, uninstall, or load holds the plugin's lock.
    #[error("plugin '{name}' is locked by another operation (lock file '{}')", path.display())]
    Locked {
        /// Plugin name.
        name: String,
        /// Lock file path.
        path: PathBuf,
    },

    /// The plugin to uninstall does not exist.
    #[error("plugin '{name}' is not installed")]
    NotInstalled {
        /// Plugin name.
        name: String,
    },

    /// A filesystem operation failed.
    #[error("I/O error at '{}': {source}", path.display())]
    Io {
        /// Path being operated on.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },
}

/// Errors raised by the frame transport.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// I/O error during read or write.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// Missing Content-Length header.
    #[error("missing Content-Length header")]
    MissingContentLength,

    /// Invalid header format.
    #[error("invalid header format")]
    InvalidHeader,

    /// The announced frame exceeds the accepted size.
    #[error("frame of {length} bytes exceeds the {limit} byte limit")]
    FrameTooLarge {
        /// Announced length.
        length: usize,
        /// Configured maximum.
        limit: usize,
    },
}

impl From<io::Error> for TransportError {
    fn from(error: io::Error) -> Self {
        Self::Io(Arc::new(error))
    }
}

/// Errors surfaced by a protocol round trip.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    /// A frame or payload did not match the expected shape.
    #[error("malformed message from plugin '{plugin}': {message}")]
    Malformed {
        /// Plugin name.
        plugin: String,
        /// Description of the mismatch.
        message: String,
    },

    /// No response arrived within the request timeout.
    #[error("plugin '{plugin}' did not answer request {id} within {timeout_ms}ms")]
    Timeout {
        /// Plugin name.
        plugin: String,
        /// Correlation identifier of the abandoned request.
        id: u64,
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The plugin process went away before answering.
    #[error("plugin '{plugin}' exited before answering")]
    PluginDied {
        /// Plugin name.
        plugin: String,
    },

    /// The plugin answered with an error message.
    #[error("plugin '{plugin}' reported an error: {message}")]
    PluginReported {
        /// Plugin name.
        plugin: String,
        /// Message sent by the plugin.
        message: String,
    },

    /// The caller cancelled the request before it completed.
    #[error("request {id} to plugin '{plugin}' was cancelled")]
    Cancelled {
        /// Plugin name.
        plugin: String,
        /// Correlation identifier of the detached request.
        id: u64,
    },

    /// Encoding or writing a frame failed.
    #[error("transport failure talking to plugin '{plugin}': {source}")]
    Transport {
        /// Plugin name.
        plugin: String,
        /// Underlying transport error.
        #[source]
        source: TransportError,
    },
}

impl ProtocolError {
    /// Returns `true` when the connection can no longer be trusted and the
    /// plugin must be torn down.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::PluginDied { .. } | Self::Transport { .. }
        )
    }
}

/// Errors raised by the process supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The plugin process could not be started.
    #[error("plugin '{name}' failed to start: {message}")]
    SpawnFailed {
        /// Plugin name.
        name: String,
        /// Human-readable failure description.
        message: String,
        /// Optional underlying I/O error.
        #[source]
        source: Option<Arc<io::Error>>,
    },

    /// The plugin never answered the handshake request.
    #[error("plugin '{name}' did not complete the handshake within {timeout_ms}ms")]
    HandshakeTimeout {
        /// Plugin name.
        name: String,
        /// Configured handshake timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The handshake failed for a reason other than the timeout.
    #[error("handshake with plugin '{name}' failed: {source}")]
    Handshake {
        /// Plugin name.
        name: String,
        /// Protocol failure observed during the handshake.
        #[source]
        source: ProtocolError,
    },
}

/// Errors surfaced by the plugin manager façade.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The plugin exists but is not currently loaded.
    #[error("plugin '{name}' is not loaded")]
    NotLoaded {
        /// Plugin name.
        name: String,
    },

    /// No plugin with that name has been discovered.
    #[error("plugin '{name}' is not installed")]
    NotFound {
        /// Plugin name.
        name: String,
    },

    /// The installed plugin's manifest could not be read.
    #[error("plugin '{name}' has an unusable manifest: {source}")]
    Manifest {
        /// Plugin name.
        name: String,
        /// Underlying manifest error.
        #[source]
        source: ManifestError,
    },

    /// The install lock could not be taken.
    #[error(transparent)]
    Install(#[from] InstallError),

    /// Starting or handshaking the plugin process failed.
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    /// A protocol round trip failed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Scanning the plugins root failed.
    #[error("failed to scan plugins directory '{}': {source}", path.display())]
    Io {
        /// Directory being scanned.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },
}

#[cfg(test)]
mod tests;
