//! Plugin hosting for `gitspace`.
//!
//! The `gitspace-plugins` crate turns plugin references into installed
//! plugins and runs them as supervised child processes. Plugins are
//! long-lived: once loaded they answer menu and command requests over a
//! length-prefixed JSON protocol on their standard I/O until they are
//! unloaded or the host shuts down.
//!
//! # Architecture
//!
//! Work flows through four stages:
//!
//! 1. A [`SourceResolver`] maps a reference (`catalog://name`, a git URL, or
//!    a local path) to a [`StagedSource`], downloading or cloning through a
//!    [`SourceFetcher`] when needed.
//! 2. The [`Installer`] validates the staged [`PluginManifest`] and copies
//!    the declared sources to `<plugins root>/<name>` under an
//!    [`InstallLock`].
//! 3. The [`PluginManager`] discovers installed plugins and loads them on
//!    demand; each running plugin is owned by a [`Supervisor`].
//! 4. Requests travel over a [`Connection`], which correlates replies by id
//!    and allows one request in flight per plugin.
//!
//! Plugin authors implement [`PluginHandler`] and hand it to [`serve`].
//!
//! # Example
//!
//! ```rust,no_run
//! use gitspace_plugins::{ManagerSettings, PluginManager};
//!
//! let manager = PluginManager::new(ManagerSettings::new("/home/me/.ssot/gitspace/plugins"));
//! manager.discover().expect("plugins root is readable");
//! manager.load("hello").expect("plugin starts");
//! for item in manager.get_menu("hello").expect("menu") {
//!     println!("{} -> {}", item.label(), item.command());
//! }
//! ```

pub mod catalog;
pub mod connection;
pub mod error;
pub mod fetch;
pub mod installer;
pub mod lock;
pub mod manager;
pub mod manifest;
pub mod protocol;
pub mod resolver;
pub mod supervisor;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

#[cfg(test)]
mod tests;

pub use self::catalog::{CatalogEntry, CatalogIndex, CatalogLocation};
pub use self::connection::{CancellationToken, Connection};
pub use self::error::{
    FetchError, InstallError, ManagerError, ManifestError, ProtocolError, ResolveError,
    SupervisorError, TransportError,
};
pub use self::fetch::{RemoteFetcher, SourceFetcher};
pub use self::installer::{InstalledPlugin, Installer};
pub use self::lock::InstallLock;
pub use self::manager::{ManagerSettings, PluginManager, PluginState, PluginSummary};
pub use self::manifest::{PluginManifest, PluginSource, SourceRepository};
pub use self::protocol::{
    CommandRequest, CommandResult, HandlerReply, MenuItem, PluginHandler, serve,
};
pub use self::resolver::{SourceResolver, StagedSource};
pub use self::supervisor::{PluginCommand, PluginLauncher, ProcessLauncher, Supervisor};
