//! Lifecycle of one plugin process.
//!
//! A [`Supervisor`] starts the plugin through a [`PluginLauncher`], confirms it
//! speaks the protocol with a handshake request, and tears it down by closing
//! its stdin, waiting for a voluntary exit, and killing it once the grace
//! period elapses.

use std::ffi::OsString;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::connection::{CancellationToken, Connection};
use crate::error::{ManifestError, ProtocolError, SupervisorError};
use crate::manifest::PluginManifest;
use crate::protocol::MessageKind;

/// Log target for supervisor operations.
const SUPERVISOR_TARGET: &str = "gitspace_plugins::supervisor";

/// Log target under which plugin stderr lines are re-emitted.
pub const PLUGIN_STDERR_TARGET: &str = "gitspace_plugins::plugin_stderr";

const EXIT_POLL: Duration = Duration::from_millis(10);

/// How to launch an installed plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginCommand {
    name: String,
    program: PathBuf,
    args: Vec<OsString>,
    working_dir: PathBuf,
}

impl PluginCommand {
    /// Creates a command running `program` with `args` inside `working_dir`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        program: impl Into<PathBuf>,
        args: Vec<OsString>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
            working_dir: working_dir.into(),
        }
    }

    /// Builds the launch command for a plugin installed in `directory`.
    ///
    /// The first source is the primary one. When its entry point names a
    /// file inside the plugin directory that file is executed; otherwise the
    /// entry point is resolved on `PATH` and given the source file as its
    /// argument.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::Invalid`] when the manifest declares no
    /// sources.
    pub fn for_installed(
        manifest: &PluginManifest,
        directory: &Path,
    ) -> Result<Self, ManifestError> {
        let primary = manifest
            .primary_source()
            .ok_or_else(|| ManifestError::invalid("sources", "no primary source to launch"))?;
        let local_entry = directory.join(primary.entry_point());
        let command = if local_entry.is_file() {
            Self::new(manifest.name(), local_entry, Vec::new(), directory)
        } else {
            Self::new(
                manifest.name(),
                primary.entry_point(),
                vec![directory.join(primary.path()).into_os_string()],
                directory,
            )
        };
        Ok(command)
    }

    /// Returns the plugin name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the program to execute.
    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Returns the program arguments.
    #[must_use]
    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// Returns the working directory of the process.
    #[must_use]
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }
}

/// Control over a launched plugin process.
pub trait ProcessHandle: Send {
    /// Returns the operating-system process identifier, when there is one.
    fn id(&self) -> Option<u32>;

    /// Returns `true` once the process has exited.
    ///
    /// # Errors
    ///
    /// Returns the I/O error raised while querying the process.
    fn try_wait(&mut self) -> io::Result<bool>;

    /// Forcibly stops the process.
    ///
    /// # Errors
    ///
    /// Returns the I/O error raised while signalling the process.
    fn kill(&mut self) -> io::Result<()>;

    /// Blocks until the process has exited and reaps it.
    ///
    /// # Errors
    ///
    /// Returns the I/O error raised while waiting.
    fn wait(&mut self) -> io::Result<()>;
}

/// A launched plugin: its process handle and the host ends of its pipes.
pub struct SpawnedPlugin {
    /// Process control.
    pub process: Box<dyn ProcessHandle>,
    /// Host end of the plugin's stdin.
    pub stdin: Box<dyn Write + Send>,
    /// Host end of the plugin's stdout.
    pub stdout: Box<dyn Read + Send>,
}

/// Starts plugin processes.
pub trait PluginLauncher: Send + Sync {
    /// Launches `command` with piped stdin and stdout.
    ///
    /// # Errors
    ///
    /// Returns the I/O error raised while starting the process.
    fn launch(&self, command: &PluginCommand) -> io::Result<SpawnedPlugin>;
}

/// Launches plugins as operating-system processes.
///
/// Stderr is forwarded line by line to [`PLUGIN_STDERR_TARGET`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLauncher;

impl PluginLauncher for ProcessLauncher {
    fn launch(&self, command: &PluginCommand) -> io::Result<SpawnedPlugin> {
        debug!(
            target: SUPERVISOR_TARGET,
            plugin = command.name(),
            program = %command.program().display(),
            args = ?command.args(),
            "spawning plugin process"
        );
        let mut child = Command::new(command.program())
            .args(command.args())
            .current_dir(command.working_dir())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(io::Error::other("plugin pipes were not captured"));
        };
        if let Some(stderr) = child.stderr.take() {
            forward_stderr(command.name(), stderr);
        }

        Ok(SpawnedPlugin {
            process: Box::new(ChildProcess(child)),
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
        })
    }
}

struct ChildProcess(Child);

impl ProcessHandle for ChildProcess {
    fn id(&self) -> Option<u32> {
        Some(self.0.id())
    }

    fn try_wait(&mut self) -> io::Result<bool> {
        Ok(self.0.try_wait()?.is_some())
    }

    fn kill(&mut self) -> io::Result<()> {
        self.0.kill()
    }

    fn wait(&mut self) -> io::Result<()> {
        self.0.wait().map(|_| ())
    }
}

fn forward_stderr<R: Read + Send + 'static>(plugin: &str, stderr: R) {
    let name = plugin.to_owned();
    let spawned = thread::Builder::new()
        .name(format!("gitspace-plugin-{plugin}-stderr"))
        .spawn(move || {
            for line in BufReader::new(stderr).lines() {
                match line {
                    Ok(line) => info!(target: PLUGIN_STDERR_TARGET, plugin = %name, "{line}"),
                    Err(error) => {
                        debug!(target: PLUGIN_STDERR_TARGET, plugin = %name, %error, "stderr closed");
                        break;
                    }
                }
            }
        });
    if let Err(error) = spawned {
        warn!(target: SUPERVISOR_TARGET, plugin, %error, "cannot forward plugin stderr");
    }
}

/// Lifecycle stage of a supervised plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Nothing launched yet.
    NotStarted,
    /// Process launched, handshake pending.
    Starting,
    /// Handshake completed.
    Running,
    /// Teardown in progress.
    Stopping,
    /// Process gone.
    Stopped,
}

/// Owns one plugin process and its protocol connection.
pub struct Supervisor {
    name: String,
    state: SupervisorState,
    process: Option<Box<dyn ProcessHandle>>,
    connection: Option<Arc<Connection>>,
}

impl Supervisor {
    /// Creates a supervisor for the plugin `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: SupervisorState::NotStarted,
            process: None,
            connection: None,
        }
    }

    /// Returns the plugin name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the lifecycle stage.
    #[must_use]
    pub const fn state(&self) -> SupervisorState {
        self.state
    }

    /// Returns the process identifier while a process is attached.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|process| process.id())
    }

    /// Returns the protocol connection while one is attached.
    #[must_use]
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.clone()
    }

    /// Launches the plugin and attaches a connection to its pipes.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::SpawnFailed`] if the process cannot be
    /// started or its reader thread cannot be created.
    pub fn start(
        &mut self,
        launcher: &dyn PluginLauncher,
        command: &PluginCommand,
    ) -> Result<(), SupervisorError> {
        self.state = SupervisorState::Starting;
        let spawned = launcher.launch(command).map_err(|source| {
            self.state = SupervisorState::Stopped;
            let message = if source.kind() == io::ErrorKind::NotFound {
                format!("entry point '{}' not found", command.program().display())
            } else {
                format!("cannot execute '{}'", command.program().display())
            };
            SupervisorError::SpawnFailed {
                name: self.name.clone(),
                message,
                source: Some(Arc::new(source)),
            }
        })?;

        let SpawnedPlugin {
            mut process,
            stdin,
            stdout,
        } = spawned;
        let connection = match Connection::new(self.name.clone(), stdout, stdin) {
            Ok(connection) => connection,
            Err(source) => {
                let _ = process.kill();
                let _ = process.wait();
                self.state = SupervisorState::Stopped;
                return Err(SupervisorError::SpawnFailed {
                    name: self.name.clone(),
                    message: String::from("cannot start the reader thread"),
                    source: Some(Arc::new(source)),
                });
            }
        };

        info!(target: SUPERVISOR_TARGET, plugin = %self.name, pid = ?process.id(), "plugin process started");
        self.process = Some(process);
        self.connection = Some(Arc::new(connection));
        Ok(())
    }

    /// Probes the plugin with a menu request.
    ///
    /// Any well-formed reply, including an `error` reply, completes the
    /// handshake. On failure the process is torn down.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::HandshakeTimeout`] when no reply arrives
    /// within `timeout` and [`SupervisorError::Handshake`] for any other
    /// protocol failure.
    pub fn handshake(&mut self, timeout: Duration) -> Result<(), SupervisorError> {
        let Some(connection) = self.connection.clone() else {
            return Err(SupervisorError::Handshake {
                name: self.name.clone(),
                source: ProtocolError::PluginDied {
                    plugin: self.name.clone(),
                },
            });
        };

        match connection.request(
            MessageKind::MenuRequest,
            Value::Null,
            timeout,
            &CancellationToken::new(),
        ) {
            Ok(_) => {
                self.state = SupervisorState::Running;
                debug!(target: SUPERVISOR_TARGET, plugin = %self.name, "handshake complete");
                Ok(())
            }
            Err(ProtocolError::Timeout { .. }) => {
                warn!(target: SUPERVISOR_TARGET, plugin = %self.name, "handshake timed out");
                self.terminate(Duration::ZERO);
                Err(SupervisorError::HandshakeTimeout {
                    name: self.name.clone(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
            Err(source) => {
                warn!(target: SUPERVISOR_TARGET, plugin = %self.name, error = %source, "handshake failed");
                self.terminate(Duration::ZERO);
                Err(SupervisorError::Handshake {
                    name: self.name.clone(),
                    source,
                })
            }
        }
    }

    /// Returns `true` while the process runs and its output stream is open.
    pub fn is_alive(&mut self) -> bool {
        if self.state != SupervisorState::Running {
            return false;
        }
        let open = self
            .connection
            .as_ref()
            .is_some_and(|connection| connection.is_open());
        let running = self
            .process
            .as_mut()
            .is_some_and(|process| matches!(process.try_wait(), Ok(false)));
        open && running
    }

    /// Stops the plugin: closes its stdin, waits up to `grace` for it to exit,
    /// then kills and reaps it. Does nothing once stopped.
    pub fn terminate(&mut self, grace: Duration) {
        if matches!(
            self.state,
            SupervisorState::NotStarted | SupervisorState::Stopped
        ) {
            return;
        }
        self.state = SupervisorState::Stopping;
        if let Some(connection) = &self.connection {
            connection.close_outbound();
        }

        if let Some(mut process) = self.process.take() {
            if !wait_for_exit(process.as_mut(), grace) {
                warn!(
                    target: SUPERVISOR_TARGET,
                    plugin = %self.name,
                    grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                    "plugin did not exit within grace period, killing"
                );
                if let Err(error) = process.kill() {
                    debug!(target: SUPERVISOR_TARGET, plugin = %self.name, %error, "kill failed");
                }
            }
            if let Err(error) = process.wait() {
                debug!(target: SUPERVISOR_TARGET, plugin = %self.name, %error, "reap failed");
            }
        }

        if let Some(connection) = self.connection.take() {
            connection.reap_workers();
        }
        self.state = SupervisorState::Stopped;
        info!(target: SUPERVISOR_TARGET, plugin = %self.name, "plugin stopped");
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.terminate(Duration::ZERO);
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("pid", &self.pid())
            .finish_non_exhaustive()
    }
}

fn wait_for_exit(process: &mut dyn ProcessHandle, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    loop {
        match process.try_wait() {
            Ok(true) => return true,
            Ok(false) => {}
            Err(error) => {
                warn!(target: SUPERVISOR_TARGET, %error, "failed to check plugin status");
                return false;
            }
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return false;
        }
        thread::sleep(remaining.min(EXIT_POLL));
    }
}
