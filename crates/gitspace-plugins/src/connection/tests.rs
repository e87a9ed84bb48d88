//! Unit tests for the host-side connection using in-memory pipes.

use std::io::{Cursor, PipeReader, PipeWriter, pipe};
use std::sync::Barrier;

use rstest::rstest;
use serde_json::json;

use super::*;

const GENEROUS: Duration = Duration::from_secs(5);

type PluginReader = FrameReader<PipeReader>;
type PluginWriter = FrameWriter<PipeWriter>;

/// Connects a host connection to a fake plugin running on its own thread.
fn connect<W, F>(wrap_writer: W, plugin: F) -> (Connection, JoinHandle<()>)
where
    W: FnOnce(PipeWriter) -> BoxedWriter,
    F: FnOnce(PluginReader, PluginWriter) + Send + 'static,
{
    let (host_reader, plugin_writer) = pipe().expect("plugin to host pipe");
    let (plugin_reader, host_writer) = pipe().expect("host to plugin pipe");
    let handle = thread::spawn(move || {
        plugin(FrameReader::new(plugin_reader), FrameWriter::new(plugin_writer));
    });
    let connection =
        Connection::new("fake", host_reader, wrap_writer(host_writer)).expect("connection");
    (connection, handle)
}

fn connect_plain<F>(plugin: F) -> (Connection, JoinHandle<()>)
where
    F: FnOnce(PluginReader, PluginWriter) + Send + 'static,
{
    connect(|writer| -> BoxedWriter { Box::new(writer) }, plugin)
}

fn next_request(reader: &mut PluginReader) -> Option<ProtocolMessage> {
    let frame = reader.receive().expect("request frame")?;
    Some(ProtocolMessage::from_bytes(&frame).expect("request"))
}

fn reply(writer: &mut PluginWriter, message: &ProtocolMessage) {
    writer
        .send(&message.to_bytes().expect("encode"))
        .expect("reply frame");
}

fn wait_until_closed(connection: &Connection) {
    let deadline = Instant::now() + GENEROUS;
    while connection.is_open() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
}

fn menu_reply(id: u64) -> ProtocolMessage {
    ProtocolMessage::new(
        id,
        MessageKind::MenuResponse,
        json!([{ "label": "Run", "command": "run" }]),
    )
}

/// Answers every request with a menu or a text echo of the command.
fn answering_plugin(mut reader: PluginReader, mut writer: PluginWriter) {
    while let Some(request) = next_request(&mut reader) {
        let message = match request.kind {
            MessageKind::MenuRequest => menu_reply(request.id),
            _ => ProtocolMessage::new(
                request.id,
                MessageKind::CommandResponse,
                json!({ "kind": "text", "text": request.payload["command"] }),
            ),
        };
        reply(&mut writer, &message);
    }
}

#[rstest]
fn get_menu_returns_items() {
    let (connection, _plugin) = connect_plain(answering_plugin);
    let menu = connection
        .get_menu(GENEROUS, &CancellationToken::new())
        .expect("menu");
    assert_eq!(menu, vec![MenuItem::new("Run", "run")]);
}

#[rstest]
fn execute_command_relays_result() {
    let (connection, _plugin) = connect_plain(answering_plugin);
    let result = connection
        .execute_command("greet", BTreeMap::new(), GENEROUS, &CancellationToken::new())
        .expect("result");
    assert_eq!(result, CommandResult::text("greet"));
}

#[rstest]
fn correlation_ids_start_at_one_and_increase() {
    let (ids_tx, ids_rx) = mpsc::channel();
    let (connection, _plugin) = connect_plain(move |mut reader, mut writer| {
        while let Some(request) = next_request(&mut reader) {
            let _ = ids_tx.send(request.id);
            reply(&mut writer, &menu_reply(request.id));
        }
    });
    for _ in 0..3 {
        connection
            .get_menu(GENEROUS, &CancellationToken::new())
            .expect("menu");
    }
    let ids: Vec<u64> = ids_rx.try_iter().collect();
    assert_eq!(ids, vec![1, 2, 3]);
}

#[rstest]
fn error_replies_become_plugin_reported() {
    let (connection, _plugin) = connect_plain(|mut reader, mut writer| {
        if let Some(request) = next_request(&mut reader) {
            reply(&mut writer, &ProtocolMessage::error(request.id, "no menu today"));
        }
    });
    let error = connection
        .get_menu(GENEROUS, &CancellationToken::new())
        .expect_err("must fail");
    assert!(
        matches!(&error, ProtocolError::PluginReported { message, .. } if message == "no menu today"),
        "unexpected error: {error}"
    );
}

#[rstest]
fn plugin_exit_during_request_is_plugin_died() {
    let (connection, _plugin) = connect_plain(|mut reader, writer| {
        let _ = next_request(&mut reader);
        drop(writer);
    });
    let started = Instant::now();
    let error = connection
        .get_menu(GENEROUS, &CancellationToken::new())
        .expect_err("must fail");
    assert!(matches!(error, ProtocolError::PluginDied { .. }), "got {error}");
    assert!(started.elapsed() < GENEROUS, "death should be detected before the timeout");
    assert!(!connection.is_open());
}

#[rstest]
fn requests_after_close_fail_immediately() {
    let (connection, plugin) = connect_plain(|_reader, writer| drop(writer));
    plugin.join().expect("plugin thread");
    wait_until_closed(&connection);
    let error = connection
        .get_menu(GENEROUS, &CancellationToken::new())
        .expect_err("must fail");
    assert!(matches!(error, ProtocolError::PluginDied { .. }));
}

#[rstest]
fn silent_plugin_times_out() {
    let (connection, _plugin) = connect_plain(|mut reader, _writer| {
        while next_request(&mut reader).is_some() {}
    });
    let error = connection
        .get_menu(Duration::from_millis(60), &CancellationToken::new())
        .expect_err("must fail");
    match error {
        ProtocolError::Timeout { id, timeout_ms, .. } => {
            assert_eq!(id, 1);
            assert_eq!(timeout_ms, 60);
        }
        other => panic!("expected Timeout, got {other}"),
    }
}

fn garbage_reply(writer: &mut PluginWriter, id: u64) {
    writer
        .send(format!(r#"{{"id":{id},"kind":"bogus"}}"#).as_bytes())
        .expect("garbage frame");
}

#[rstest]
fn undecodable_reply_fails_only_its_request() {
    let (connection, _plugin) = connect_plain(|mut reader, mut writer| {
        if let Some(request) = next_request(&mut reader) {
            garbage_reply(&mut writer, request.id);
        }
        answering_plugin(reader, writer);
    });
    let error = connection
        .get_menu(GENEROUS, &CancellationToken::new())
        .expect_err("must fail");
    assert!(matches!(error, ProtocolError::Malformed { .. }), "got {error}");
    assert!(connection.is_open(), "framing survives a bad payload");

    let menu = connection
        .get_menu(GENEROUS, &CancellationToken::new())
        .expect("next request succeeds");
    assert_eq!(menu.len(), 1);
}

#[rstest]
fn late_garbage_for_a_cancelled_request_is_dropped() {
    let (connection, _plugin) = connect_plain(|mut reader, mut writer| {
        if let Some(first) = next_request(&mut reader) {
            thread::sleep(Duration::from_millis(150));
            garbage_reply(&mut writer, first.id);
            writer.send(b"not json").expect("frame without id");
        }
        answering_plugin(reader, writer);
    });
    let token = CancellationToken::new();
    let canceller = {
        let token = token.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            token.cancel();
        })
    };
    let error = connection.get_menu(GENEROUS, &token).expect_err("must fail");
    canceller.join().expect("canceller");
    assert!(matches!(error, ProtocolError::Cancelled { id: 1, .. }), "got {error}");

    let menu = connection
        .get_menu(GENEROUS, &CancellationToken::new())
        .expect("garbage for request 1 must not reach request 2");
    assert_eq!(menu.len(), 1);
}

/// Accepts no bytes until released, like a plugin that stopped reading stdin.
struct StalledWriter {
    release: mpsc::Receiver<()>,
}

impl Write for StalledWriter {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        let _ = self.release.recv();
        Err(io::Error::from(io::ErrorKind::BrokenPipe))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[rstest]
fn plugin_that_stops_reading_cannot_stall_callers() {
    let (host_reader, plugin_output) = pipe().expect("plugin to host pipe");
    let (release, stalled) = mpsc::channel();
    let connection = Connection::new("fake", host_reader, StalledWriter { release: stalled })
        .expect("connection");
    let mut args = BTreeMap::new();
    args.insert(String::from("blob"), "x".repeat(1 << 20));
    let started = Instant::now();

    let error = connection
        .execute_command("run", args, Duration::from_millis(200), &CancellationToken::new())
        .expect_err("must fail");
    assert!(matches!(error, ProtocolError::Timeout { id: 1, .. }), "got {error}");

    let error = connection
        .get_menu(Duration::from_millis(100), &CancellationToken::new())
        .expect_err("must fail");
    assert!(matches!(error, ProtocolError::Timeout { id: 2, .. }), "got {error}");

    connection.close_outbound();
    assert!(started.elapsed() < GENEROUS, "took {:?}", started.elapsed());

    drop(release);
    drop(plugin_output);
    wait_until_closed(&connection);
    connection.reap_workers();
}

#[rstest]
fn broken_framing_closes_the_connection() {
    let inbound = Cursor::new(b"Content-Length: nope\r\n\r\n".to_vec());
    let connection = Connection::new("fake", inbound, io::sink()).expect("connection");
    wait_until_closed(&connection);
    let error = connection
        .get_menu(GENEROUS, &CancellationToken::new())
        .expect_err("must fail");
    assert!(
        matches!(
            error,
            ProtocolError::Transport {
                source: TransportError::InvalidHeader,
                ..
            }
        ),
        "got {error}"
    );
}

#[rstest]
fn cancellation_detaches_caller_and_connection_stays_usable() {
    let (connection, _plugin) = connect_plain(|mut reader, mut writer| {
        if let Some(first) = next_request(&mut reader) {
            thread::sleep(Duration::from_millis(150));
            reply(&mut writer, &menu_reply(first.id));
        }
        answering_plugin(reader, writer);
    });
    let token = CancellationToken::new();
    let canceller = {
        let token = token.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            token.cancel();
        })
    };
    let error = connection.get_menu(GENEROUS, &token).expect_err("must fail");
    canceller.join().expect("canceller");
    assert!(matches!(error, ProtocolError::Cancelled { id: 1, .. }), "got {error}");

    let menu = connection
        .get_menu(GENEROUS, &CancellationToken::new())
        .expect("next request succeeds");
    assert_eq!(menu.len(), 1);
}

/// Records one `write` event per flushed frame.
struct RecordingWriter {
    inner: PipeWriter,
    log: Arc<Mutex<Vec<&'static str>>>,
}

impl Write for RecordingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()?;
        self.log.lock().expect("log lock").push("write");
        Ok(())
    }
}

#[rstest]
fn concurrent_requests_never_interleave() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let plugin_log = Arc::clone(&log);
    let writer_log = Arc::clone(&log);
    let (connection, _plugin) = connect(
        move |inner| -> BoxedWriter {
            Box::new(RecordingWriter {
                inner,
                log: writer_log,
            })
        },
        move |mut reader, mut writer| {
            while let Some(request) = next_request(&mut reader) {
                thread::sleep(Duration::from_millis(80));
                plugin_log.lock().expect("log lock").push("reply");
                reply(
                    &mut writer,
                    &ProtocolMessage::new(
                        request.id,
                        MessageKind::CommandResponse,
                        json!({ "kind": "text", "text": "ok" }),
                    ),
                );
            }
        },
    );

    let connection = Arc::new(connection);
    let start = Arc::new(Barrier::new(2));
    let callers: Vec<_> = (0..2)
        .map(|_| {
            let connection = Arc::clone(&connection);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                connection.execute_command("run", BTreeMap::new(), GENEROUS, &CancellationToken::new())
            })
        })
        .collect();
    for caller in callers {
        caller.join().expect("caller").expect("command");
    }

    let events = log.lock().expect("log lock").clone();
    assert_eq!(events, vec!["write", "reply", "write", "reply"]);
}
