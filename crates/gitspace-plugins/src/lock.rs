//! Per-plugin advisory lock files.
//!
//! The lock is a `.<name>.lock` file in the plugins root created with
//! create-new semantics and stamped with the holder's pid. Holding the
//! [`InstallLock`] value means holding the lock; dropping it removes the
//! file. A lock whose pid no longer names a live process is stale and is
//! cleared by the next acquirer.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, warn};

use crate::error::InstallError;

/// Log target for lock operations.
const LOCK_TARGET: &str = "gitspace_plugins::lock";

const RETRY_INTERVAL: Duration = Duration::from_millis(25);

/// Age after which a lock file without a readable pid counts as stale.
const UNSTAMPED_LOCK_AGE: Duration = Duration::from_secs(5);

/// Exclusive hold on one plugin's install directory.
#[derive(Debug)]
pub struct InstallLock {
    path: PathBuf,
    _file: File,
}

impl InstallLock {
    /// Returns the lock file path for `name` under `root`.
    #[must_use]
    pub fn path_for(root: &Path, name: &str) -> PathBuf {
        root.join(format!(".{name}.lock"))
    }

    /// Acquires the lock for `name`, retrying until `wait` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`InstallError::Locked`] if another holder keeps the lock for
    /// the whole wait and [`InstallError::Io`] if the file cannot be created.
    pub fn acquire(root: &Path, name: &str, wait: Duration) -> Result<Self, InstallError> {
        let path = Self::path_for(root, name);
        let deadline = Instant::now() + wait;
        loop {
            match create_lock_file(&path) {
                Ok(file) => {
                    debug!(target: LOCK_TARGET, plugin = name, file = %path.display(), "acquired install lock");
                    return Ok(Self { path, _file: file });
                }
                Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {
                    if clear_stale_lock(&path, name)? {
                        continue;
                    }
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(InstallError::Locked {
                            name: name.to_owned(),
                            path,
                        });
                    }
                    thread::sleep(remaining.min(RETRY_INTERVAL));
                }
                Err(source) => {
                    return Err(InstallError::Io {
                        path,
                        source: Arc::new(source),
                    });
                }
            }
        }
    }

    /// Returns the lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstallLock {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Err(error) if error.kind() != io::ErrorKind::NotFound => {
                warn!(
                    target: LOCK_TARGET,
                    file = %self.path.display(),
                    error = %error,
                    "failed to remove lock file"
                );
            }
            _ => {}
        }
    }
}

/// Removes the lock at `path` when its holder is gone.
///
/// Returns whether the file was cleared, in which case the caller retries at
/// once.
fn clear_stale_lock(path: &Path, name: &str) -> Result<bool, InstallError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(true),
        Err(source) => {
            return Err(InstallError::Io {
                path: path.to_path_buf(),
                source: Arc::new(source),
            });
        }
    };
    let stale = match contents.trim().parse::<u32>() {
        Ok(pid) if pid != 0 => !process_alive(pid),
        // The holder may be between creating the file and writing its pid.
        _ => unstamped_for(path) >= UNSTAMPED_LOCK_AGE,
    };
    if !stale {
        return Ok(false);
    }
    // Another acquirer may have replaced the file since it was read.
    if fs::read_to_string(path).ok().as_deref() != Some(contents.as_str()) {
        return Ok(false);
    }
    warn!(
        target: LOCK_TARGET,
        plugin = name,
        file = %path.display(),
        holder = contents.trim(),
        "removing stale install lock"
    );
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(true),
        Err(source) => Err(InstallError::Io {
            path: path.to_path_buf(),
            source: Arc::new(source),
        }),
    }
}

fn unstamped_for(path: &Path) -> Duration {
    fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .unwrap_or_default()
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(Errno::ESRCH) => false,
        Err(errno) => {
            debug!(target: LOCK_TARGET, pid, %errno, "cannot check lock holder; assuming alive");
            true
        }
    }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

fn create_lock_file(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    writeln!(file, "{}", std::process::id())?;
    Ok(file)
}
