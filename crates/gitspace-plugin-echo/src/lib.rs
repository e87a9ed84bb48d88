//! Reference plugin for the `gitspace` plugin host.
//!
//! The plugin stays resident and answers framed requests on stdin until the
//! host closes the stream. It offers a single `Run` menu item and a handful of
//! diagnostic commands that the host's end-to-end tests rely on:
//!
//! | command | arguments  | reply                                  |
//! |---------|------------|----------------------------------------|
//! | `run`   |            | text greeting                          |
//! | `echo`  | `text`     | the argument, unchanged                |
//! | `args`  | any        | the arguments as a JSON object         |
//! | `sleep` | `ms`       | `slept` after the delay                |
//! | `fail`  | `message`  | an error reply                         |
//! | `exit`  |            | none; the process exits                |


use std::io::{Read, Write};
use std::thread;
use std::time::Duration;

use gitspace_plugins::{
    CommandRequest, CommandResult, HandlerReply, MenuItem, PluginHandler, TransportError, serve,
};

/// Text returned by the `run` command.
pub const RUN_GREETING: &str = "hello from gitspace-plugin-echo";

/// Handler behind the reference plugin.
#[derive(Debug, Default)]
pub struct EchoHandler {
    handled: u64,
}

impl EchoHandler {
    /// Returns how many commands were handled so far.
    #[must_use]
    pub const fn handled(&self) -> u64 {
        self.handled
    }
}

impl PluginHandler for EchoHandler {
    fn menu(&mut self) -> Vec<MenuItem> {
        vec![MenuItem::new("Run", "run")]
    }

    fn execute(&mut self, request: &CommandRequest) -> HandlerReply {
        self.handled += 1;
        match request.command() {
            "run" => HandlerReply::Result(CommandResult::text(RUN_GREETING)),
            "echo" => HandlerReply::Result(CommandResult::text(
                request.arg("text").unwrap_or_default(),
            )),
            "args" => match serde_json::to_value(request.args()) {
                Ok(data) => HandlerReply::Result(CommandResult::Data { data }),
                Err(error) => HandlerReply::Error(error.to_string()),
            },
            "sleep" => match request.arg("ms").map(str::parse::<u64>) {
                Some(Ok(millis)) => {
                    thread::sleep(Duration::from_millis(millis));
                    HandlerReply::Result(CommandResult::text("slept"))
                }
                Some(Err(error)) => HandlerReply::Error(format!("invalid 'ms' argument: {error}")),
                None => HandlerReply::Error(String::from("missing 'ms' argument")),
            },
            "fail" => HandlerReply::Error(
                request
                    .arg("message")
                    .unwrap_or("command failed")
                    .to_owned(),
            ),
            "exit" => HandlerReply::Stop,
            other => HandlerReply::Error(format!("unknown command '{other}'")),
        }
    }
}

/// Serves [`EchoHandler`] over the given streams until the host hangs up.
///
/// # Errors
///
/// Returns a [`TransportError`] when the stream breaks mid-frame or a reply
/// cannot be written.
pub fn run<R: Read, W: Write>(reader: R, writer: W) -> Result<(), TransportError> {
    let mut handler = EchoHandler::default();
    serve(reader, writer, &mut handler)
}
