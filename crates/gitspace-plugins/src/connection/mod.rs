//! Correlated request/response channel to one plugin process.
//!
//! A [`Connection`] runs two threads per plugin: a writer that owns the
//! plugin's stdin and a reader draining its stdout. Replies are routed to the
//! waiting caller by correlation identifier. Callers are serialised by a
//! request gate so at most one request per plugin is in flight, and both the
//! write and the wait for the reply count against the request timeout.

use std::collections::{BTreeMap, HashMap};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{ProtocolError, TransportError};
use crate::protocol::{CommandRequest, CommandResult, MenuItem, MessageKind, ProtocolMessage};
use crate::transport::{FrameReader, FrameWriter};

/// Log target for connection operations.
const CONNECTION_TARGET: &str = "gitspace_plugins::connection";

/// Longest single wait between cancellation checks.
const WAIT_SLICE: Duration = Duration::from_millis(25);

type Reply = Result<ProtocolMessage, ProtocolError>;
type BoxedWriter = Box<dyn Write + Send>;
type Written = Result<(), TransportError>;

/// One encoded frame queued for the writer thread.
struct OutboundFrame {
    bytes: Vec<u8>,
    written: mpsc::Sender<Written>,
}

/// Correlation identifier recovered from a frame that failed to decode.
#[derive(Deserialize)]
struct FrameId {
    id: u64,
}

/// Cooperative cancellation flag shared between a caller and a waiter.
///
/// Cancelling detaches the waiting caller; the plugin is not interrupted and
/// its late reply is discarded.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Creates a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct RoutingState {
    pending: HashMap<u64, mpsc::Sender<Reply>>,
    closed: Option<ProtocolError>,
}

struct Routing {
    state: Mutex<RoutingState>,
}

impl Routing {
    fn lock(&self) -> MutexGuard<'_, RoutingState> {
        self.state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    fn detach(&self, id: u64) {
        self.lock().pending.remove(&id);
    }

    fn deliver(&self, plugin: &str, message: ProtocolMessage) {
        let id = message.id;
        let sender = self.lock().pending.remove(&id);
        match sender {
            Some(sender) => {
                let _ = sender.send(Ok(message));
            }
            None => debug!(
                target: CONNECTION_TARGET,
                plugin,
                id,
                "dropping reply for unknown or detached request"
            ),
        }
    }

    fn fail(&self, plugin: &str, id: u64, error: ProtocolError) {
        let sender = self.lock().pending.remove(&id);
        match sender {
            Some(sender) => {
                let _ = sender.send(Err(error));
            }
            None => debug!(
                target: CONNECTION_TARGET,
                plugin,
                id,
                "dropping undecodable reply for unknown or detached request"
            ),
        }
    }

    fn close(&self, reason: ProtocolError) {
        let drained: Vec<_> = {
            let mut state = self.lock();
            if state.closed.is_none() {
                state.closed = Some(reason.clone());
            }
            state.pending.drain().collect()
        };
        for (_, sender) in drained {
            let _ = sender.send(Err(reason.clone()));
        }
    }
}

/// Host side of the plugin protocol over a pair of byte streams.
pub struct Connection {
    plugin: String,
    outbound: Mutex<Option<mpsc::Sender<OutboundFrame>>>,
    routing: Arc<Routing>,
    next_id: AtomicU64,
    gate: Mutex<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    /// Starts the reader thread over `reader` and the writer thread over
    /// `writer`.
    ///
    /// # Errors
    ///
    /// Returns the I/O error raised if either thread cannot be spawned.
    pub fn new<R, W>(plugin: impl Into<String>, reader: R, writer: W) -> io::Result<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let plugin = plugin.into();
        let routing = Arc::new(Routing {
            state: Mutex::new(RoutingState::default()),
        });
        let thread_routing = Arc::clone(&routing);
        let thread_plugin = plugin.clone();
        let reader_handle = thread::Builder::new()
            .name(format!("gitspace-plugin-{plugin}-reader"))
            .spawn(move || read_loop(&thread_plugin, reader, &thread_routing))?;

        let (outbound, queued) = mpsc::channel();
        let thread_plugin = plugin.clone();
        let boxed: BoxedWriter = Box::new(writer);
        let writer_handle = thread::Builder::new()
            .name(format!("gitspace-plugin-{plugin}-writer"))
            .spawn(move || write_loop(&thread_plugin, boxed, &queued))?;

        Ok(Self {
            plugin,
            outbound: Mutex::new(Some(outbound)),
            routing,
            next_id: AtomicU64::new(1),
            gate: Mutex::new(()),
            workers: Mutex::new(vec![reader_handle, writer_handle]),
        })
    }

    /// Returns the plugin name used in errors and logs.
    #[must_use]
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// Returns `true` while the inbound stream is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.routing.lock().closed.is_none()
    }

    /// Sends one request and waits for the correlated reply.
    ///
    /// Returns the raw reply message, which may be an `error` reply.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::PluginDied`] if the plugin closed its streams,
    /// [`ProtocolError::Timeout`] if the request cannot be written or no
    /// reply arrives within `timeout`,
    /// [`ProtocolError::Cancelled`] if `cancel` fires first, and
    /// [`ProtocolError::Malformed`] or [`ProtocolError::Transport`] if the
    /// inbound stream carries garbage.
    pub fn request(
        &self,
        kind: MessageKind,
        payload: Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ProtocolMessage, ProtocolError> {
        let _gate = self
            .gate
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = mpsc::channel();
        {
            let mut state = self.routing.lock();
            if let Some(reason) = &state.closed {
                return Err(reason.clone());
            }
            state.pending.insert(id, sender);
        }

        let deadline = Instant::now() + timeout;
        let message = ProtocolMessage::new(id, kind, payload);
        debug!(target: CONNECTION_TARGET, plugin = %self.plugin, id, %kind, "sending request");
        let written = match self.enqueue(&message) {
            Ok(written) => written,
            Err(error) => {
                self.routing.detach(id);
                return Err(error);
            }
        };
        if let Err(error) = self.wait_until(id, &written, deadline, timeout, cancel)? {
            self.routing.detach(id);
            debug!(target: CONNECTION_TARGET, plugin = %self.plugin, id, %error, "write failed");
            return Err(self.died());
        }

        self.wait_until(id, &receiver, deadline, timeout, cancel)?
    }

    /// Requests the plugin menu.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`request`](Self::request), plus
    /// [`ProtocolError::PluginReported`] for `error` replies and
    /// [`ProtocolError::Malformed`] for replies that are not a menu.
    pub fn get_menu(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<MenuItem>, ProtocolError> {
        self.request(MessageKind::MenuRequest, Value::Null, timeout, cancel)?
            .into_reply(&self.plugin, MessageKind::MenuResponse)
    }

    /// Asks the plugin to run `command` with `args`.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`request`](Self::request), plus
    /// [`ProtocolError::PluginReported`] for `error` replies and
    /// [`ProtocolError::Malformed`] for replies that are not a command result.
    pub fn execute_command(
        &self,
        command: &str,
        args: BTreeMap<String, String>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandResult, ProtocolError> {
        let request = CommandRequest::new(command, args);
        let payload = serde_json::to_value(&request).map_err(|error| ProtocolError::Malformed {
            plugin: self.plugin.clone(),
            message: error.to_string(),
        })?;
        self.request(MessageKind::CommandRequest, payload, timeout, cancel)?
            .into_reply(&self.plugin, MessageKind::CommandResponse)
    }

    /// Closes the outbound stream so the plugin observes end of input.
    ///
    /// The writer thread drops stdin once any frame it is writing completes.
    /// This call never blocks on the plugin.
    pub fn close_outbound(&self) {
        let outbound = self
            .outbound
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .take();
        if outbound.is_some() {
            debug!(target: CONNECTION_TARGET, plugin = %self.plugin, "closing plugin stdin");
        }
    }

    /// Joins the reader and writer threads that have already finished.
    ///
    /// A thread still blocked on a stream held open by a descendant process is
    /// detached instead.
    pub fn reap_workers(&self) {
        let handles = std::mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(|poison| poison.into_inner()),
        );
        for handle in handles {
            let name = handle.thread().name().unwrap_or("worker").to_owned();
            if !handle.is_finished() {
                debug!(target: CONNECTION_TARGET, plugin = %self.plugin, thread = %name, "detaching thread");
                continue;
            }
            if handle.join().is_err() {
                warn!(target: CONNECTION_TARGET, plugin = %self.plugin, thread = %name, "thread panicked");
            }
        }
    }

    fn enqueue(&self, message: &ProtocolMessage) -> Result<mpsc::Receiver<Written>, ProtocolError> {
        let bytes = message
            .to_bytes()
            .map_err(|error| ProtocolError::Malformed {
                plugin: self.plugin.clone(),
                message: error.to_string(),
            })?;
        let (written, receiver) = mpsc::channel();
        let outbound = self
            .outbound
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        let Some(queue) = outbound.as_ref() else {
            return Err(self.died());
        };
        queue
            .send(OutboundFrame { bytes, written })
            .map_err(|_| self.died())?;
        Ok(receiver)
    }

    /// Waits on `receiver` until `deadline`, checking `cancel` in slices.
    ///
    /// On cancellation, timeout, or a vanished sender the request `id` is
    /// detached before the error is returned.
    fn wait_until<T>(
        &self,
        id: u64,
        receiver: &mpsc::Receiver<T>,
        deadline: Instant,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<T, ProtocolError> {
        loop {
            if cancel.is_cancelled() {
                self.routing.detach(id);
                debug!(target: CONNECTION_TARGET, plugin = %self.plugin, id, "request cancelled");
                return Err(ProtocolError::Cancelled {
                    plugin: self.plugin.clone(),
                    id,
                });
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.routing.detach(id);
                warn!(target: CONNECTION_TARGET, plugin = %self.plugin, id, "request timed out");
                return Err(ProtocolError::Timeout {
                    plugin: self.plugin.clone(),
                    id,
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
            match receiver.recv_timeout(remaining.min(WAIT_SLICE)) {
                Ok(value) => return Ok(value),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    self.routing.detach(id);
                    return Err(self.died());
                }
            }
        }
    }

    fn died(&self) -> ProtocolError {
        ProtocolError::PluginDied {
            plugin: self.plugin.clone(),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close_outbound();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("plugin", &self.plugin)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

fn write_loop(plugin: &str, writer: BoxedWriter, queued: &mpsc::Receiver<OutboundFrame>) {
    let mut frames = FrameWriter::new(writer);
    for frame in queued {
        let result = frames.send(&frame.bytes);
        let failed = result.is_err();
        let _ = frame.written.send(result);
        if failed {
            break;
        }
    }
    debug!(target: CONNECTION_TARGET, plugin, "closed plugin stdin");
}

fn read_loop<R: Read>(plugin: &str, reader: R, routing: &Routing) {
    let mut frames = FrameReader::new(reader);
    let reason = loop {
        match frames.receive() {
            Ok(Some(bytes)) => match ProtocolMessage::from_bytes(&bytes) {
                Ok(message) => routing.deliver(plugin, message),
                Err(error) => match serde_json::from_slice::<FrameId>(&bytes) {
                    Ok(FrameId { id }) => {
                        warn!(target: CONNECTION_TARGET, plugin, id, %error, "undecodable reply from plugin");
                        routing.fail(
                            plugin,
                            id,
                            ProtocolError::Malformed {
                                plugin: plugin.to_owned(),
                                message: error.to_string(),
                            },
                        );
                    }
                    Err(_) => {
                        warn!(target: CONNECTION_TARGET, plugin, %error, "dropping frame without a correlation id");
                    }
                },
            },
            Ok(None) => {
                debug!(target: CONNECTION_TARGET, plugin, "plugin closed its output");
                break ProtocolError::PluginDied {
                    plugin: plugin.to_owned(),
                };
            }
            Err(TransportError::Io(error)) => {
                debug!(target: CONNECTION_TARGET, plugin, %error, "plugin output failed");
                break ProtocolError::PluginDied {
                    plugin: plugin.to_owned(),
                };
            }
            Err(error) => {
                warn!(target: CONNECTION_TARGET, plugin, %error, "plugin broke framing");
                break ProtocolError::Transport {
                    plugin: plugin.to_owned(),
                    source: error,
                };
            }
        }
    };
    routing.close(reason);
}

#[cfg(test)]
mod tests;
