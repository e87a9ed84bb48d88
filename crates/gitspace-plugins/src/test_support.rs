//! In-process plugin fakes shared by unit and behaviour tests.

use std::io::{self, PipeReader, PipeWriter, Read, Write, pipe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::manifest::{MANIFEST_FILE_NAME, PluginManifest, PluginSource};
use crate::protocol::{
    CommandRequest, CommandResult, HandlerReply, MenuItem, MessageKind, PluginHandler, ProtocolMessage,
    serve,
};
use crate::supervisor::{PluginCommand, PluginLauncher, ProcessHandle, SpawnedPlugin};
use crate::transport::{FrameReader, FrameWriter};

/// Plugin body run on a thread against the plugin ends of the pipes.
pub(crate) type Behaviour = Arc<dyn Fn(PipeReader, PipeWriter) + Send + Sync>;

/// Handler mirroring the reference plugin: `Run` menu plus a few commands.
#[derive(Debug, Default)]
pub(crate) struct ScriptedHandler;

impl PluginHandler for ScriptedHandler {
    fn menu(&mut self) -> Vec<MenuItem> {
        vec![MenuItem::new("Run", "run")]
    }

    fn execute(&mut self, request: &CommandRequest) -> HandlerReply {
        match request.command() {
            "run" => HandlerReply::Result(CommandResult::text("ran")),
            "echo" => HandlerReply::Result(CommandResult::text(
                request.arg("text").unwrap_or_default(),
            )),
            "sleep" => {
                let millis = request
                    .arg("ms")
                    .and_then(|ms| ms.parse().ok())
                    .unwrap_or(0);
                thread::sleep(Duration::from_millis(millis));
                HandlerReply::Result(CommandResult::text("slept"))
            }
            "exit" => HandlerReply::Stop,
            other => HandlerReply::Error(format!("unknown command '{other}'")),
        }
    }
}

/// Serves [`ScriptedHandler`] until the host closes stdin.
pub(crate) fn scripted() -> Behaviour {
    Arc::new(|reader, writer| {
        let _ = serve(reader, writer, &mut ScriptedHandler);
    })
}

/// Reads requests forever without answering.
pub(crate) fn silent() -> Behaviour {
    Arc::new(|reader, _writer| {
        let mut frames = FrameReader::new(reader);
        while let Ok(Some(_)) = frames.receive() {}
    })
}

fn answer_handshake<R: Read, W: Write>(frames: &mut FrameReader<R>, out: &mut FrameWriter<W>) {
    if let Ok(Some(frame)) = frames.receive()
        && let Ok(request) = ProtocolMessage::from_bytes(&frame)
    {
        let reply = ProtocolMessage::new(request.id, MessageKind::MenuResponse, serde_json::json!([]));
        if let Ok(bytes) = reply.to_bytes() {
            let _ = out.send(&bytes);
        }
    }
}

/// Answers the handshake request, then exits on the next request.
pub(crate) fn handshake_then_exit() -> Behaviour {
    Arc::new(|reader, writer| {
        let mut frames = FrameReader::new(reader);
        let mut out = FrameWriter::new(writer);
        answer_handshake(&mut frames, &mut out);
        let _ = frames.receive();
    })
}

/// Answers the handshake request, then stops reading stdin for `stall`
/// while keeping it open.
pub(crate) fn handshake_then_stop_reading(stall: Duration) -> Behaviour {
    Arc::new(move |reader, writer| {
        let mut frames = FrameReader::new(reader);
        let mut out = FrameWriter::new(writer);
        answer_handshake(&mut frames, &mut out);
        thread::sleep(stall);
    })
}

/// Process handle for a plugin running on a thread.
pub(crate) struct ThreadProcess {
    exited: Arc<AtomicBool>,
    killed: Arc<AtomicBool>,
}

impl ProcessHandle for ThreadProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    fn try_wait(&mut self) -> io::Result<bool> {
        Ok(self.exited.load(Ordering::SeqCst) || self.killed.load(Ordering::SeqCst))
    }

    fn kill(&mut self) -> io::Result<()> {
        self.killed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn wait(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Launcher running every plugin as a thread with the same behaviour.
pub(crate) struct ThreadLauncher {
    behaviour: Option<Behaviour>,
    launched: Mutex<Vec<PluginCommand>>,
    killed: Mutex<Vec<Arc<AtomicBool>>>,
}

impl ThreadLauncher {
    pub(crate) fn new(behaviour: Behaviour) -> Self {
        Self {
            behaviour: Some(behaviour),
            launched: Mutex::new(Vec::new()),
            killed: Mutex::new(Vec::new()),
        }
    }

    /// A launcher whose every launch fails.
    pub(crate) fn failing() -> Self {
        Self {
            behaviour: None,
            launched: Mutex::new(Vec::new()),
            killed: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn launched(&self) -> Vec<PluginCommand> {
        self.launched.lock().expect("launch log").clone()
    }

    /// Returns `true` when any launched plugin was force-killed.
    pub(crate) fn any_killed(&self) -> bool {
        self.killed
            .lock()
            .expect("kill log")
            .iter()
            .any(|flag| flag.load(Ordering::SeqCst))
    }
}

impl PluginLauncher for ThreadLauncher {
    fn launch(&self, command: &PluginCommand) -> io::Result<SpawnedPlugin> {
        self.launched.lock().expect("launch log").push(command.clone());
        let Some(behaviour) = self.behaviour.clone() else {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such entry point"));
        };
        let (host_reader, plugin_writer) = pipe()?;
        let (plugin_reader, host_writer) = pipe()?;
        let exited = Arc::new(AtomicBool::new(false));
        let killed = Arc::new(AtomicBool::new(false));
        self.killed.lock().expect("kill log").push(Arc::clone(&killed));

        let thread_exited = Arc::clone(&exited);
        thread::Builder::new()
            .name(format!("fake-plugin-{}", command.name()))
            .spawn(move || {
                behaviour(plugin_reader, plugin_writer);
                thread_exited.store(true, Ordering::SeqCst);
            })?;

        Ok(SpawnedPlugin {
            process: Box::new(ThreadProcess { exited, killed }),
            stdin: Box::new(host_writer),
            stdout: Box::new(host_reader),
        })
    }
}

/// Writes an installed plugin layout with an executable `main` entry point.
pub(crate) fn install_fake_plugin(root: &Path, name: &str) -> PluginManifest {
    let manifest = PluginManifest::new(name, "1.0.0", vec![PluginSource::new("main", "main")])
        .with_description(format!("{name} test plugin"));
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).expect("plugin dir");
    std::fs::write(
        dir.join(MANIFEST_FILE_NAME),
        manifest.to_toml_string().expect("manifest"),
    )
    .expect("write manifest");
    std::fs::write(dir.join("main"), "#!/bin/sh\n").expect("write entry point");
    manifest
}
