//! Materialises staged plugin sources under the plugins root.
//!
//! An installed plugin is the directory `<root>/<name>` holding the manifest
//! and every declared source at its relative path. Reinstalling is a
//! destructive overwrite; nothing from the previous install survives.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::InstallError;
use crate::lock::InstallLock;
use crate::manifest::{MANIFEST_FILE_NAME, PluginManifest, load_manifest, validate_relative_path};
use crate::resolver::StagedSource;

/// Log target for installer operations.
const INSTALLER_TARGET: &str = "gitspace_plugins::installer";

/// A plugin laid out under the plugins root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPlugin {
    directory: PathBuf,
    manifest: PluginManifest,
}

impl InstalledPlugin {
    /// Returns the plugin name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.manifest.name()
    }

    /// Returns the install directory.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Returns the installed manifest.
    #[must_use]
    pub const fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }
}

/// Installs, removes, and lists plugins under one root directory.
#[derive(Debug, Clone)]
pub struct Installer {
    root: PathBuf,
    lock_wait: Duration,
}

impl Installer {
    /// Creates an installer for `root`; lock acquisition waits up to
    /// `lock_wait`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, lock_wait: Duration) -> Self {
        Self {
            root: root.into(),
            lock_wait,
        }
    }

    /// Returns the plugins root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the install directory of `name`.
    #[must_use]
    pub fn plugin_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Creates the plugins root if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`InstallError::Io`] if the directory cannot be created.
    pub fn ensure_root(&self) -> Result<(), InstallError> {
        fs::create_dir_all(&self.root).map_err(|source| io_error(&self.root, source))
    }

    /// Takes the install lock of `name`.
    ///
    /// # Errors
    ///
    /// Returns [`InstallError::Locked`] when the lock stays held for the whole
    /// wait, or [`InstallError::Io`] if the root is unusable.
    pub fn lock(&self, name: &str) -> Result<InstallLock, InstallError> {
        self.ensure_root()?;
        InstallLock::acquire(&self.root, name, self.lock_wait)
    }

    /// Installs `staged`, replacing any previous install of the same plugin.
    ///
    /// The staging directory, when there is one, is removed once `staged` is
    /// dropped at the end of the call.
    ///
    /// # Errors
    ///
    /// Returns [`InstallError::ManifestInvalid`] for an unusable manifest,
    /// [`InstallError::CleanupFailed`] if the previous install cannot be
    /// removed, [`InstallError::MissingSourceFile`] for an absent source, and
    /// [`InstallError::Locked`] or [`InstallError::Io`] for lock and
    /// filesystem failures.
    pub fn install(&self, staged: StagedSource) -> Result<InstalledPlugin, InstallError> {
        let manifest =
            load_manifest(staged.manifest_path()).map_err(InstallError::ManifestInvalid)?;
        let name = manifest.name();
        let _lock = self.lock(name)?;

        let dest = self.plugin_dir(name);
        if dest.exists() {
            debug!(target: INSTALLER_TARGET, plugin = name, dest = %dest.display(), "removing previous install");
            fs::remove_dir_all(&dest).map_err(|source| InstallError::CleanupFailed {
                path: dest.clone(),
                source: Arc::new(source),
            })?;
        }
        fs::create_dir_all(&dest).map_err(|source| io_error(&dest, source))?;

        let manifest_dest = dest.join(MANIFEST_FILE_NAME);
        fs::copy(staged.manifest_path(), &manifest_dest)
            .map_err(|source| io_error(&manifest_dest, source))?;

        for source in manifest.sources() {
            let from = staged.root().join(source.path());
            let to = dest.join(source.path());
            if !from.exists() {
                return Err(InstallError::MissingSourceFile {
                    path: source.path().to_path_buf(),
                });
            }
            copy_entry(&from, &to)?;
        }

        if let Some(entry) = manifest
            .primary_source()
            .map(|primary| Path::new(primary.entry_point()))
            .filter(|entry| validate_relative_path(entry).is_ok())
        {
            make_executable(&dest.join(entry))?;
        }

        info!(
            target: INSTALLER_TARGET,
            plugin = name,
            version = manifest.version(),
            dest = %dest.display(),
            "installed plugin"
        );
        Ok(InstalledPlugin {
            directory: dest,
            manifest,
        })
    }

    /// Removes the install directory of `name`.
    ///
    /// # Errors
    ///
    /// Returns [`InstallError::NotInstalled`] if there is nothing to remove,
    /// [`InstallError::CleanupFailed`] if removal fails, and lock errors as
    /// for [`lock`](Self::lock).
    pub fn uninstall(&self, name: &str) -> Result<(), InstallError> {
        let dest = self.plugin_dir(name);
        if name.is_empty() || name.starts_with('.') || !dest.is_dir() {
            return Err(InstallError::NotInstalled {
                name: name.to_owned(),
            });
        }
        let _lock = self.lock(name)?;
        fs::remove_dir_all(&dest).map_err(|source| InstallError::CleanupFailed {
            path: dest.clone(),
            source: Arc::new(source),
        })?;
        info!(target: INSTALLER_TARGET, plugin = name, "uninstalled plugin");
        Ok(())
    }

    /// Lists installed plugin directory names in sorted order.
    ///
    /// Hidden entries, including lock files, are skipped. A missing root
    /// lists nothing.
    ///
    /// # Errors
    ///
    /// Returns [`InstallError::Io`] if the root cannot be read.
    pub fn installed(&self) -> Result<Vec<String>, InstallError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(io_error(&self.root, source)),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| io_error(&self.root, source))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !entry.path().is_dir() {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }
}

fn copy_entry(from: &Path, to: &Path) -> Result<(), InstallError> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(|source| io_error(parent, source))?;
    }
    if from.is_dir() {
        fs::create_dir_all(to).map_err(|source| io_error(to, source))?;
        let entries = fs::read_dir(from).map_err(|source| io_error(from, source))?;
        for entry in entries {
            let entry = entry.map_err(|source| io_error(from, source))?;
            copy_entry(&entry.path(), &to.join(entry.file_name()))?;
        }
        return Ok(());
    }
    fs::copy(from, to).map_err(|source| io_error(to, source))?;
    Ok(())
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<(), InstallError> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_file() => metadata,
        Ok(_) => return Ok(()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(source) => return Err(io_error(path, source)),
    };
    let mut permissions = metadata.permissions();
    permissions.set_mode(permissions.mode() | 0o755);
    fs::set_permissions(path, permissions).map_err(|source| io_error(path, source))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<(), InstallError> {
    Ok(())
}

fn io_error(path: &Path, source: io::Error) -> InstallError {
    InstallError::Io {
        path: path.to_path_buf(),
        source: Arc::new(source),
    }
}
