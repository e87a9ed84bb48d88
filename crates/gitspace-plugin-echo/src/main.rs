//! Binary entrypoint for the reference echo plugin.

use std::io::{self, Write};
use std::process::ExitCode;

use gitspace_plugin_echo::run;

fn main() -> ExitCode {
    let stdin = io::stdin();
    let stdout = io::stdout();

    match run(stdin.lock(), stdout.lock()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            writeln!(io::stderr().lock(), "gitspace-plugin-echo: {error}").ok();
            ExitCode::FAILURE
        }
    }
}
