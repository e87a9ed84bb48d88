//! Message types exchanged between the host and a plugin process.
//!
//! Every frame on the wire carries one [`ProtocolMessage`]: a correlation
//! identifier chosen by the host, a [`MessageKind`], and a JSON payload whose
//! shape depends on the kind. The host initiates every exchange and the plugin
//! answers each request with exactly one reply bearing the same identifier.
//!
//! The plugin side of the contract is implemented by [`serve`], which plugin
//! authors drive with their own [`PluginHandler`].

use std::collections::BTreeMap;
use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{ProtocolError, TransportError};
use crate::transport::{FrameReader, FrameWriter};

/// Log target for plugin-side serving.
const SERVE_TARGET: &str = "gitspace_plugins::serve";

/// Discriminates the payload carried by a [`ProtocolMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Host asks for the plugin menu. Empty payload.
    MenuRequest,
    /// Plugin returns its menu as an array of [`MenuItem`].
    MenuResponse,
    /// Host asks the plugin to run a [`CommandRequest`].
    CommandRequest,
    /// Plugin returns a [`CommandResult`].
    CommandResponse,
    /// Plugin reports a failure with an [`ErrorPayload`].
    Error,
}

impl MessageKind {
    /// Returns the wire name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MenuRequest => "menu_request",
            Self::MenuResponse => "menu_response",
            Self::CommandRequest => "command_request",
            Self::CommandResponse => "command_response",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One framed message.
///
/// # Example
///
/// ```
/// use gitspace_plugins::protocol::{MessageKind, ProtocolMessage};
///
/// let ping = ProtocolMessage::new(1, MessageKind::MenuRequest, serde_json::Value::Null);
/// let bytes = ping.to_bytes().expect("encode");
/// let decoded = ProtocolMessage::from_bytes(&bytes).expect("decode");
/// assert_eq!(decoded.kind, MessageKind::MenuRequest);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    /// Correlation identifier linking a reply to its request.
    pub id: u64,
    /// Payload discriminator.
    pub kind: MessageKind,
    /// Kind-specific payload.
    #[serde(default)]
    pub payload: Value,
}

impl ProtocolMessage {
    /// Creates a message.
    #[must_use]
    pub const fn new(id: u64, kind: MessageKind, payload: Value) -> Self {
        Self { id, kind, payload }
    }

    /// Creates an `error` reply for request `id`.
    #[must_use]
    pub fn error(id: u64, message: impl Into<String>) -> Self {
        let payload = serde_json::json!({ "message": message.into() });
        Self::new(id, MessageKind::Error, payload)
    }

    /// Decodes a message from frame bytes.
    ///
    /// # Errors
    ///
    /// Returns the decoder error when the bytes are not a message.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Encodes the message as frame bytes.
    ///
    /// # Errors
    ///
    /// Returns the encoder error if the payload cannot be serialised.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Interprets a reply as the payload of the `expected` kind.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::PluginReported`] for `error` replies and
    /// [`ProtocolError::Malformed`] when the kind differs from `expected` or
    /// the payload does not decode as `T`.
    pub fn into_reply<T: DeserializeOwned>(
        self,
        plugin: &str,
        expected: MessageKind,
    ) -> Result<T, ProtocolError> {
        if self.kind == MessageKind::Error {
            let message = serde_json::from_value::<ErrorPayload>(self.payload)
                .map_or_else(|_| String::from("unspecified plugin error"), |e| e.message);
            return Err(ProtocolError::PluginReported {
                plugin: plugin.to_owned(),
                message,
            });
        }
        if self.kind != expected {
            return Err(ProtocolError::Malformed {
                plugin: plugin.to_owned(),
                message: format!("expected {expected} reply, got {}", self.kind),
            });
        }
        serde_json::from_value(self.payload).map_err(|error| ProtocolError::Malformed {
            plugin: plugin.to_owned(),
            message: format!("undecodable {expected} payload: {error}"),
        })
    }
}

/// One entry in a plugin menu.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuItem {
    label: String,
    command: String,
}

impl MenuItem {
    /// Creates a menu item.
    #[must_use]
    pub fn new(label: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            command: command.into(),
        }
    }

    /// Returns the human-readable label.
    #[must_use]
    pub const fn label(&self) -> &str {
        self.label.as_str()
    }

    /// Returns the command identifier sent back when the item is chosen.
    #[must_use]
    pub const fn command(&self) -> &str {
        self.command.as_str()
    }
}

/// Payload of a `command_request`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    command: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    args: BTreeMap<String, String>,
}

impl CommandRequest {
    /// Creates a request.
    #[must_use]
    pub fn new(command: impl Into<String>, args: BTreeMap<String, String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    /// Returns the command identifier.
    #[must_use]
    pub const fn command(&self) -> &str {
        self.command.as_str()
    }

    /// Returns the arguments.
    #[must_use]
    pub const fn args(&self) -> &BTreeMap<String, String> {
        &self.args
    }

    /// Returns one argument by name.
    #[must_use]
    pub fn arg(&self, name: &str) -> Option<&str> {
        self.args.get(name).map(String::as_str)
    }
}

/// Payload of a `command_response`.
///
/// The `kind` field discriminates plain text output from structured data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandResult {
    /// Human-readable output.
    Text {
        /// The text to display.
        text: String,
    },
    /// Structured output relayed without interpretation.
    Data {
        /// Arbitrary JSON produced by the plugin.
        data: Value,
    },
}

impl CommandResult {
    /// Creates a text result.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// Payload of an `error` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Failure description.
    pub message: String,
}

/// What a [`PluginHandler`] wants the serve loop to do with a command.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerReply {
    /// Reply with a `command_response`.
    Result(CommandResult),
    /// Reply with an `error`.
    Error(String),
    /// Stop serving without replying.
    Stop,
}

/// Plugin-side behaviour driven by [`serve`].
pub trait PluginHandler {
    /// Returns the menu offered to the host.
    fn menu(&mut self) -> Vec<MenuItem>;

    /// Runs one command.
    fn execute(&mut self, request: &CommandRequest) -> HandlerReply;
}

/// Answers host requests read from `reader` until the stream ends.
///
/// Malformed requests and unsupported kinds are answered with an `error`
/// reply so the host is never left waiting.
///
/// # Errors
///
/// Returns a [`TransportError`] if framing breaks or a reply cannot be
/// written.
pub fn serve<R, W, H>(reader: R, writer: W, handler: &mut H) -> Result<(), TransportError>
where
    R: Read,
    W: Write,
    H: PluginHandler + ?Sized,
{
    let mut frames = FrameReader::new(reader);
    let mut out = FrameWriter::new(writer);

    while let Some(frame) = frames.receive()? {
        let message = match ProtocolMessage::from_bytes(&frame) {
            Ok(message) => message,
            Err(error) => {
                warn!(target: SERVE_TARGET, %error, "discarding undecodable request");
                send(&mut out, &ProtocolMessage::error(0, format!("undecodable request: {error}")))?;
                continue;
            }
        };
        debug!(target: SERVE_TARGET, id = message.id, kind = %message.kind, "request received");

        let reply = match message.kind {
            MessageKind::MenuRequest => match serde_json::to_value(handler.menu()) {
                Ok(menu) => ProtocolMessage::new(message.id, MessageKind::MenuResponse, menu),
                Err(error) => ProtocolMessage::error(message.id, error.to_string()),
            },
            MessageKind::CommandRequest => {
                match serde_json::from_value::<CommandRequest>(message.payload) {
                    Ok(request) => match handler.execute(&request) {
                        HandlerReply::Result(result) => command_response(message.id, &result),
                        HandlerReply::Error(text) => ProtocolMessage::error(message.id, text),
                        HandlerReply::Stop => return Ok(()),
                    },
                    Err(error) => ProtocolMessage::error(
                        message.id,
                        format!("invalid command_request payload: {error}"),
                    ),
                }
            }
            other => ProtocolMessage::error(
                message.id,
                format!("unsupported message kind '{other}'"),
            ),
        };
        send(&mut out, &reply)?;
    }
    Ok(())
}

fn command_response(id: u64, result: &CommandResult) -> ProtocolMessage {
    match serde_json::to_value(result) {
        Ok(payload) => ProtocolMessage::new(id, MessageKind::CommandResponse, payload),
        Err(error) => ProtocolMessage::error(id, error.to_string()),
    }
}

fn send<W: Write>(out: &mut FrameWriter<W>, message: &ProtocolMessage) -> Result<(), TransportError> {
    let bytes = message.to_bytes().map_err(io::Error::from)?;
    out.send(&bytes)
}

#[cfg(test)]
mod tests;
