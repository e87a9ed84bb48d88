//! Unit tests for the protocol message types and the plugin serve loop.

use std::collections::BTreeMap;
use std::io::Cursor;

use rstest::rstest;
use serde_json::json;

use super::*;

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[rstest]
#[case::menu_request(MessageKind::MenuRequest, "menu_request")]
#[case::menu_response(MessageKind::MenuResponse, "menu_response")]
#[case::command_request(MessageKind::CommandRequest, "command_request")]
#[case::command_response(MessageKind::CommandResponse, "command_response")]
#[case::error(MessageKind::Error, "error")]
fn kinds_use_snake_case_names(#[case] kind: MessageKind, #[case] wire: &str) {
    assert_eq!(serde_json::to_value(kind).expect("encode"), json!(wire));
    assert_eq!(kind.as_str(), wire);
}

#[test]
fn menu_request_payload_defaults_to_null() {
    let message = ProtocolMessage::from_bytes(br#"{"id":4,"kind":"menu_request"}"#)
        .expect("decode");
    assert_eq!(message.id, 4);
    assert_eq!(message.payload, Value::Null);
}

#[test]
fn menu_is_a_json_array_of_items() {
    let menu = vec![MenuItem::new("Run", "run")];
    let encoded = serde_json::to_value(&menu).expect("encode");
    assert_eq!(encoded, json!([{ "label": "Run", "command": "run" }]));
}

#[test]
fn command_request_args_are_optional() {
    let request: CommandRequest =
        serde_json::from_value(json!({ "command": "run" })).expect("decode");
    assert_eq!(request.command(), "run");
    assert!(request.args().is_empty());
}

#[test]
fn command_request_exposes_args() {
    let args = BTreeMap::from([(String::from("name"), String::from("world"))]);
    let request = CommandRequest::new("greet", args);
    assert_eq!(request.arg("name"), Some("world"));
    assert_eq!(request.arg("missing"), None);
}

#[rstest]
#[case::text(CommandResult::text("done"), json!({ "kind": "text", "text": "done" }))]
#[case::data(
    CommandResult::Data { data: json!({ "count": 2 }) },
    json!({ "kind": "data", "data": { "count": 2 } })
)]
fn command_results_are_tagged_by_kind(#[case] result: CommandResult, #[case] expected: Value) {
    assert_eq!(serde_json::to_value(&result).expect("encode"), expected);
}

// ---------------------------------------------------------------------------
// Reply interpretation
// ---------------------------------------------------------------------------

#[test]
fn into_reply_decodes_expected_kind() {
    let reply = ProtocolMessage::new(
        1,
        MessageKind::MenuResponse,
        json!([{ "label": "Run", "command": "run" }]),
    );
    let menu: Vec<MenuItem> = reply
        .into_reply("hello", MessageKind::MenuResponse)
        .expect("menu");
    assert_eq!(menu, vec![MenuItem::new("Run", "run")]);
}

#[test]
fn into_reply_maps_error_replies() {
    let reply = ProtocolMessage::error(1, "boom");
    let error = reply
        .into_reply::<Vec<MenuItem>>("hello", MessageKind::MenuResponse)
        .expect_err("must fail");
    match error {
        ProtocolError::PluginReported { plugin, message } => {
            assert_eq!(plugin, "hello");
            assert_eq!(message, "boom");
        }
        other => panic!("expected PluginReported, got {other}"),
    }
}

#[rstest]
#[case::wrong_kind(ProtocolMessage::new(1, MessageKind::CommandResponse, json!([])))]
#[case::wrong_shape(ProtocolMessage::new(1, MessageKind::MenuResponse, json!({ "items": 1 })))]
fn into_reply_rejects_mismatches(#[case] reply: ProtocolMessage) {
    let error = reply
        .into_reply::<Vec<MenuItem>>("hello", MessageKind::MenuResponse)
        .expect_err("must fail");
    assert!(matches!(error, ProtocolError::Malformed { .. }));
}

// ---------------------------------------------------------------------------
// Serve loop
// ---------------------------------------------------------------------------

struct ScriptedHandler {
    executed: Vec<String>,
}

impl PluginHandler for ScriptedHandler {
    fn menu(&mut self) -> Vec<MenuItem> {
        vec![MenuItem::new("Run", "run")]
    }

    fn execute(&mut self, request: &CommandRequest) -> HandlerReply {
        self.executed.push(request.command().to_owned());
        match request.command() {
            "run" => HandlerReply::Result(CommandResult::text("ran")),
            "stop" => HandlerReply::Stop,
            other => HandlerReply::Error(format!("unknown command '{other}'")),
        }
    }
}

fn frames(messages: &[Value]) -> Vec<u8> {
    let mut buffer = Vec::new();
    {
        let mut writer = FrameWriter::new(&mut buffer);
        for message in messages {
            writer
                .send(&serde_json::to_vec(message).expect("encode"))
                .expect("frame");
        }
    }
    buffer
}

fn run_serve(input: &[Value]) -> (Vec<ProtocolMessage>, Vec<String>) {
    let mut handler = ScriptedHandler {
        executed: Vec::new(),
    };
    let mut output = Vec::new();
    serve(Cursor::new(frames(input)), &mut output, &mut handler).expect("serve");

    let mut replies = Vec::new();
    let mut reader = FrameReader::new(Cursor::new(output));
    while let Some(frame) = reader.receive().expect("reply frame") {
        replies.push(ProtocolMessage::from_bytes(&frame).expect("reply"));
    }
    (replies, handler.executed)
}

#[test]
fn serve_answers_menu_and_commands_with_matching_ids() {
    let (replies, executed) = run_serve(&[
        json!({ "id": 1, "kind": "menu_request", "payload": null }),
        json!({ "id": 2, "kind": "command_request", "payload": { "command": "run" } }),
    ]);

    assert_eq!(executed, vec!["run"]);
    assert_eq!(replies.len(), 2);
    assert_eq!(replies[0].id, 1);
    assert_eq!(replies[0].kind, MessageKind::MenuResponse);
    assert_eq!(replies[1].id, 2);
    assert_eq!(replies[1].payload, json!({ "kind": "text", "text": "ran" }));
}

#[test]
fn serve_reports_handler_errors() {
    let (replies, _) = run_serve(&[json!({
        "id": 9, "kind": "command_request", "payload": { "command": "nope" }
    })]);
    assert_eq!(replies[0].kind, MessageKind::Error);
    assert_eq!(replies[0].id, 9);
}

#[rstest]
#[case::unsupported_kind(json!({ "id": 3, "kind": "menu_response", "payload": [] }))]
#[case::bad_payload(json!({ "id": 3, "kind": "command_request", "payload": { "args": {} } }))]
fn serve_replies_error_to_unusable_requests(#[case] request: Value) {
    let (replies, executed) = run_serve(&[request]);
    assert!(executed.is_empty());
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].id, 3);
    assert_eq!(replies[0].kind, MessageKind::Error);
}

#[test]
fn serve_stops_without_replying_when_asked() {
    let (replies, executed) = run_serve(&[
        json!({ "id": 1, "kind": "command_request", "payload": { "command": "stop" } }),
        json!({ "id": 2, "kind": "menu_request" }),
    ]);
    assert_eq!(executed, vec!["stop"]);
    assert!(replies.is_empty());
}
