//! CLI entrypoint for `gitspace`.
//!
//! The binary delegates to [`gitspace_cli::run`], which loads configuration,
//! installs telemetry, and runs one plugin subcommand.

use std::io::{self, StderrLock, StdoutLock};
use std::process::ExitCode;

fn main() -> ExitCode {
    let mut stdout: StdoutLock<'_> = io::stdout().lock();
    let mut stderr: StderrLock<'_> = io::stderr().lock();
    gitspace_cli::run(std::env::args_os(), &mut stdout, &mut stderr)
}
