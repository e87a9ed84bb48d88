//! Unit tests for plugin host error types.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use rstest::rstest;

use super::*;

#[test]
fn invalid_manifest_message_names_field() {
    let error = ManifestError::invalid("sources[0].path", "must be relative");
    let message = error.to_string();
    assert!(
        message.contains("sources[0].path"),
        "expected field in message: {message}"
    );
    assert!(
        message.contains("must be relative"),
        "expected detail in message: {message}"
    );
}

#[test]
fn missing_source_message_includes_path() {
    let error = InstallError::MissingSourceFile {
        path: PathBuf::from("bin/main"),
    };
    assert!(error.to_string().contains("bin/main"));
}

#[rstest]
#[case::timeout(
    ProtocolError::Timeout { plugin: "slow".into(), id: 7, timeout_ms: 250 },
    true
)]
#[case::died(ProtocolError::PluginDied { plugin: "gone".into() }, true)]
#[case::transport(
    ProtocolError::Transport {
        plugin: "broken".into(),
        source: TransportError::MissingContentLength,
    },
    true
)]
#[case::reported(
    ProtocolError::PluginReported { plugin: "ok".into(), message: "nope".into() },
    false
)]
#[case::malformed(
    ProtocolError::Malformed { plugin: "ok".into(), message: "bad".into() },
    false
)]
#[case::cancelled(ProtocolError::Cancelled { plugin: "ok".into(), id: 3 }, false)]
fn fatal_protocol_errors(#[case] error: ProtocolError, #[case] expected: bool) {
    assert_eq!(error.is_fatal(), expected, "unexpected fatality for {error}");
}

#[test]
fn timeout_message_includes_numbers() {
    let error = ProtocolError::Timeout {
        plugin: "slow".into(),
        id: 42,
        timeout_ms: 1500,
    };
    let message = error.to_string();
    assert!(message.contains("42"), "expected id in message: {message}");
    assert!(
        message.contains("1500ms"),
        "expected timeout in message: {message}"
    );
}

#[test]
fn transport_error_wraps_io_errors() {
    let error = TransportError::from(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
    assert!(matches!(error, TransportError::Io(_)));
    assert!(error.to_string().contains("pipe closed"));
}

#[test]
fn manager_error_is_transparent_for_protocol_failures() {
    let error = ManagerError::from(ProtocolError::PluginDied {
        plugin: "hello".into(),
    });
    assert_eq!(error.to_string(), "plugin 'hello' exited before answering");
}

#[test]
fn spawn_failed_exposes_source() {
    let error = SupervisorError::SpawnFailed {
        name: "hello".into(),
        message: "permission denied".into(),
        source: Some(Arc::new(io::Error::from(io::ErrorKind::PermissionDenied))),
    };
    assert!(std::error::Error::source(&error).is_some());
}
