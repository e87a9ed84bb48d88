//! Registry of installed plugins and the façade the host talks to.
//!
//! The [`PluginManager`] discovers plugins on disk, loads them on demand
//! through a [`Supervisor`], and relays menu and command requests. The
//! registry mutex is only ever held for bookkeeping: spawning, handshakes,
//! round trips, and teardown all happen with it released so one slow plugin
//! never stalls the others.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::connection::{CancellationToken, Connection};
use crate::error::{InstallError, ManagerError, ManifestError, ProtocolError};
use crate::installer::Installer;
use crate::manifest::{MANIFEST_FILE_NAME, PluginManifest, load_manifest};
use crate::protocol::{CommandResult, MenuItem};
use crate::supervisor::{PluginCommand, PluginLauncher, ProcessLauncher, Supervisor};

/// Log target for manager operations.
const MANAGER_TARGET: &str = "gitspace_plugins::manager";

/// Default handshake timeout.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
/// Default request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Default grace period before a plugin is killed.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
/// Default wait for a contended install lock.
pub const DEFAULT_INSTALL_LOCK_WAIT: Duration = Duration::from_secs(5);

/// Tunables of a [`PluginManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerSettings {
    /// Directory holding one subdirectory per installed plugin.
    pub plugins_root: PathBuf,
    /// Bound on the handshake request sent after spawning.
    pub handshake_timeout: Duration,
    /// Bound on every menu or command round trip.
    pub request_timeout: Duration,
    /// How long a plugin may take to exit after its stdin closes.
    pub shutdown_grace: Duration,
    /// How long `load` waits for a contended install lock.
    pub install_lock_wait: Duration,
}

impl ManagerSettings {
    /// Creates settings for `plugins_root` with default timeouts.
    #[must_use]
    pub fn new(plugins_root: impl Into<PathBuf>) -> Self {
        Self {
            plugins_root: plugins_root.into(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            install_lock_wait: DEFAULT_INSTALL_LOCK_WAIT,
        }
    }
}

/// Runtime state of a registered plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    /// Found on disk, never started or not started since discovery.
    Discovered,
    /// Process running and handshake completed.
    Loaded,
    /// Process gone after an unload, an exit, or a fatal protocol error.
    Terminated,
}

impl PluginState {
    /// Returns the lowercase name of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Loaded => "loaded",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Listing row for one registered plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginSummary {
    /// Plugin name.
    pub name: String,
    /// Declared version.
    pub version: String,
    /// Declared description.
    pub description: Option<String>,
    /// Current runtime state.
    pub state: PluginState,
}

struct RuntimePlugin {
    manifest: PluginManifest,
    directory: PathBuf,
    supervisor: Option<Supervisor>,
    state: PluginState,
    gate: Arc<Mutex<()>>,
}

impl RuntimePlugin {
    fn discovered(manifest: PluginManifest, directory: PathBuf) -> Self {
        Self {
            manifest,
            directory,
            supervisor: None,
            state: PluginState::Discovered,
            gate: Arc::new(Mutex::new(())),
        }
    }

    fn summary(&self) -> PluginSummary {
        PluginSummary {
            name: self.manifest.name().to_owned(),
            version: self.manifest.version().to_owned(),
            description: self.manifest.description().map(str::to_owned),
            state: self.state,
        }
    }
}

/// Discovers, loads, and talks to installed plugins.
///
/// All methods take `&self`; share the manager behind an `Arc` to use it
/// from several threads. Dropping it shuts every plugin down.
pub struct PluginManager<L: PluginLauncher = ProcessLauncher> {
    settings: ManagerSettings,
    installer: Installer,
    launcher: L,
    registry: Mutex<BTreeMap<String, RuntimePlugin>>,
}

impl PluginManager<ProcessLauncher> {
    /// Creates a manager that runs plugins as operating-system processes.
    #[must_use]
    pub fn new(settings: ManagerSettings) -> Self {
        Self::with_launcher(settings, ProcessLauncher)
    }
}

impl<L: PluginLauncher> PluginManager<L> {
    /// Creates a manager that starts plugins through `launcher`.
    #[must_use]
    pub fn with_launcher(settings: ManagerSettings, launcher: L) -> Self {
        let installer = Installer::new(&settings.plugins_root, settings.install_lock_wait);
        Self {
            settings,
            installer,
            launcher,
            registry: Mutex::new(BTreeMap::new()),
        }
    }

    /// Returns the settings the manager was built with.
    #[must_use]
    pub const fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    /// Returns the installer operating on the same plugins root.
    #[must_use]
    pub const fn installer(&self) -> &Installer {
        &self.installer
    }

    /// Scans the plugins root and refreshes the registry.
    ///
    /// Subdirectories with a readable manifest become `Discovered` entries;
    /// unreadable ones are logged and skipped. Non-loaded entries whose
    /// directory disappeared are dropped. Nothing is spawned.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Io`] if the plugins root cannot be created or
    /// read.
    pub fn discover(&self) -> Result<usize, ManagerError> {
        self.installer.ensure_root().map_err(scan_error)?;
        let names = self.installer.installed().map_err(scan_error)?;

        let mut found = BTreeMap::new();
        for name in names {
            let directory = self.installer.plugin_dir(&name);
            match load_manifest(&directory.join(MANIFEST_FILE_NAME)) {
                Ok(manifest) if manifest.name() == name => {
                    found.insert(name, (manifest, directory));
                }
                Ok(manifest) => warn!(
                    target: MANAGER_TARGET,
                    directory = %directory.display(),
                    declared = manifest.name(),
                    "skipping plugin whose manifest name does not match its directory"
                ),
                Err(error) => warn!(
                    target: MANAGER_TARGET,
                    directory = %directory.display(),
                    %error,
                    "skipping plugin with unusable manifest"
                ),
            }
        }

        let count = found.len();
        let mut registry = self.registry();
        registry.retain(|name, entry| {
            entry.state == PluginState::Loaded || found.contains_key(name)
        });
        for (name, (manifest, directory)) in found {
            match registry.entry(name) {
                Entry::Occupied(mut occupied) => {
                    let entry = occupied.get_mut();
                    if entry.state != PluginState::Loaded {
                        entry.manifest = manifest;
                        entry.directory = directory;
                    }
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(RuntimePlugin::discovered(manifest, directory));
                }
            }
        }
        drop(registry);

        info!(target: MANAGER_TARGET, count, "discovered plugins");
        Ok(count)
    }

    /// Starts `name` and completes its handshake. Does nothing when the
    /// plugin is already loaded.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::NotFound`] for unknown plugins,
    /// [`ManagerError::Install`] when the install lock is contended,
    /// [`ManagerError::Manifest`] when the installed manifest is unusable,
    /// and [`ManagerError::Supervisor`] when spawn or handshake fail.
    pub fn load(&self, name: &str) -> Result<(), ManagerError> {
        let Some(gate) = self.with_entry(name, |entry| {
            (entry.state != PluginState::Loaded).then(|| Arc::clone(&entry.gate))
        })?
        else {
            return Ok(());
        };
        let _gate = gate.lock().unwrap_or_else(|poison| poison.into_inner());

        let Some(directory) = self.with_entry(name, |entry| {
            (entry.state != PluginState::Loaded).then(|| entry.directory.clone())
        })?
        else {
            return Ok(());
        };

        let mut supervisor = Supervisor::new(name);
        let manifest = {
            let _lock = self.installer.lock(name)?;
            let manifest = load_manifest(&directory.join(MANIFEST_FILE_NAME))
                .map_err(|source| manifest_error(name, source))?;
            let command = PluginCommand::for_installed(&manifest, &directory)
                .map_err(|source| manifest_error(name, source))?;
            supervisor.start(&self.launcher, &command)?;
            manifest
        };
        supervisor.handshake(self.settings.handshake_timeout)?;

        let pid = supervisor.pid();
        let mut registry = self.registry();
        let entry = registry
            .entry(name.to_owned())
            .or_insert_with(|| RuntimePlugin::discovered(manifest.clone(), directory.clone()));
        entry.manifest = manifest;
        entry.directory = directory;
        entry.supervisor = Some(supervisor);
        entry.state = PluginState::Loaded;
        drop(registry);

        info!(target: MANAGER_TARGET, plugin = name, pid = ?pid, "plugin loaded");
        Ok(())
    }

    /// Stops `name` and marks it `Terminated`. Unloading a plugin that is not
    /// running does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::NotFound`] for unknown plugins.
    pub fn unload(&self, name: &str) -> Result<(), ManagerError> {
        let gate = self.with_entry(name, |entry| Arc::clone(&entry.gate))?;
        let _gate = gate.lock().unwrap_or_else(|poison| poison.into_inner());
        let supervisor = self.with_entry(name, |entry| {
            let supervisor = entry.supervisor.take();
            if supervisor.is_some() {
                entry.state = PluginState::Terminated;
            }
            supervisor
        })?;
        if let Some(mut supervisor) = supervisor {
            supervisor.terminate(self.settings.shutdown_grace);
            info!(target: MANAGER_TARGET, plugin = name, "plugin unloaded");
        }
        Ok(())
    }

    /// Requests the menu of a loaded plugin.
    ///
    /// # Errors
    ///
    /// See [`get_menu_with`](Self::get_menu_with).
    pub fn get_menu(&self, name: &str) -> Result<Vec<MenuItem>, ManagerError> {
        self.get_menu_with(name, &CancellationToken::new())
    }

    /// Requests the menu of a loaded plugin, giving up when `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::NotFound`] or [`ManagerError::NotLoaded`] when
    /// there is no running plugin, and [`ManagerError::Protocol`] when the
    /// round trip fails. A plugin that died or timed out is `Terminated`
    /// afterwards.
    pub fn get_menu_with(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<MenuItem>, ManagerError> {
        let connection = self.connection(name)?;
        let outcome = connection.get_menu(self.settings.request_timeout, cancel);
        self.settle(name, &connection, outcome)
    }

    /// Runs `command` with `args` in a loaded plugin.
    ///
    /// # Errors
    ///
    /// See [`execute_command_with`](Self::execute_command_with).
    pub fn execute_command(
        &self,
        name: &str,
        command: &str,
        args: BTreeMap<String, String>,
    ) -> Result<CommandResult, ManagerError> {
        self.execute_command_with(name, command, args, &CancellationToken::new())
    }

    /// Runs `command` with `args` in a loaded plugin, giving up when `cancel`
    /// fires.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::NotFound`] or [`ManagerError::NotLoaded`] when
    /// there is no running plugin, and [`ManagerError::Protocol`] when the
    /// round trip fails. A plugin that died or timed out is `Terminated`
    /// afterwards.
    pub fn execute_command_with(
        &self,
        name: &str,
        command: &str,
        args: BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<CommandResult, ManagerError> {
        let connection = self.connection(name)?;
        let outcome =
            connection.execute_command(command, args, self.settings.request_timeout, cancel);
        self.settle(name, &connection, outcome)
    }

    /// Lists every registered plugin in name order.
    #[must_use]
    pub fn list_discovered(&self) -> Vec<PluginSummary> {
        self.registry().values().map(RuntimePlugin::summary).collect()
    }

    /// Returns the state of `name`, if registered.
    #[must_use]
    pub fn state(&self, name: &str) -> Option<PluginState> {
        self.registry().get(name).map(|entry| entry.state)
    }

    /// Returns the install directory of a registered plugin.
    #[must_use]
    pub fn plugin_directory(&self, name: &str) -> Option<PathBuf> {
        self.registry().get(name).map(|entry| entry.directory.clone())
    }

    /// Unloads every running plugin.
    pub fn shutdown(&self) {
        let running: Vec<Supervisor> = self
            .registry()
            .values_mut()
            .filter_map(|entry| {
                let supervisor = entry.supervisor.take()?;
                entry.state = PluginState::Terminated;
                Some(supervisor)
            })
            .collect();
        if running.is_empty() {
            return;
        }
        debug!(target: MANAGER_TARGET, count = running.len(), "shutting down plugins");
        for mut supervisor in running {
            supervisor.terminate(self.settings.shutdown_grace);
        }
    }

    fn registry(&self) -> MutexGuard<'_, BTreeMap<String, RuntimePlugin>> {
        self.registry
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    fn with_entry<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut RuntimePlugin) -> T,
    ) -> Result<T, ManagerError> {
        let mut registry = self.registry();
        let entry = registry.get_mut(name).ok_or_else(|| ManagerError::NotFound {
            name: name.to_owned(),
        })?;
        Ok(f(entry))
    }

    /// Returns the connection of a loaded, live plugin. A plugin found dead
    /// is moved to `Terminated` and reported as not loaded.
    fn connection(&self, name: &str) -> Result<Arc<Connection>, ManagerError> {
        let lookup = self.with_entry(name, |entry| {
            if entry.state != PluginState::Loaded {
                return Err(None);
            }
            let Some(supervisor) = entry.supervisor.as_mut() else {
                return Err(None);
            };
            if !supervisor.is_alive() {
                entry.state = PluginState::Terminated;
                return Err(entry.supervisor.take());
            }
            supervisor.connection().ok_or(None)
        })?;
        lookup.map_err(|dead| {
            if let Some(mut supervisor) = dead {
                warn!(target: MANAGER_TARGET, plugin = name, "plugin process is gone");
                supervisor.terminate(Duration::ZERO);
            }
            ManagerError::NotLoaded {
                name: name.to_owned(),
            }
        })
    }

    /// Tears the plugin down after a fatal protocol error on `connection`.
    fn settle<T>(
        &self,
        name: &str,
        connection: &Arc<Connection>,
        outcome: Result<T, ProtocolError>,
    ) -> Result<T, ManagerError> {
        let error = match outcome {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        if error.is_fatal() {
            warn!(target: MANAGER_TARGET, plugin = name, %error, "unloading plugin after fatal error");
            let stale = self
                .with_entry(name, |entry| {
                    let same = entry
                        .supervisor
                        .as_ref()
                        .and_then(Supervisor::connection)
                        .is_some_and(|current| Arc::ptr_eq(&current, connection));
                    if same {
                        entry.state = PluginState::Terminated;
                        entry.supervisor.take()
                    } else {
                        None
                    }
                })
                .ok()
                .flatten();
            if let Some(mut supervisor) = stale {
                supervisor.terminate(Duration::ZERO);
            }
        }
        Err(error.into())
    }
}

impl<L: PluginLauncher> Drop for PluginManager<L> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<L: PluginLauncher> fmt::Debug for PluginManager<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginManager")
            .field("plugins_root", &self.settings.plugins_root)
            .field("plugins", &self.list_discovered())
            .finish_non_exhaustive()
    }
}

fn manifest_error(name: &str, source: ManifestError) -> ManagerError {
    ManagerError::Manifest {
        name: name.to_owned(),
        source,
    }
}

fn scan_error(error: InstallError) -> ManagerError {
    match error {
        InstallError::Io { path, source } => ManagerError::Io { path, source },
        other => ManagerError::Install(other),
    }
}
