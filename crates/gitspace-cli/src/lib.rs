//! Command-line runtime for `gitspace`.
//!
//! The runtime splits leading configuration flags from the subcommand, layers
//! configuration through `ortho_config`, installs telemetry, and dispatches
//! one `plugin` subcommand against the plugin host. Output streams and the
//! configuration loader are injected so the whole flow can be exercised from
//! tests.

use std::ffi::OsString;
use std::io::Write;
use std::process::ExitCode;

use clap::Parser;
use gitspace_config::Config;

mod cli;
mod commands;
mod config;
mod errors;
pub mod telemetry;


use cli::{Cli, CliCommand};
use config::{ConfigLoader, OrthoConfigLoader, command_arguments, split_config_arguments};
use errors::AppError;

/// Exit status clap uses for usage errors.
const USAGE_EXIT_CODE: u8 = 2;

/// Runs the CLI using the provided arguments and IO handles.
#[must_use]
pub fn run<I, W, E>(args: I, stdout: &mut W, stderr: &mut E) -> ExitCode
where
    I: IntoIterator<Item = OsString>,
    W: Write,
    E: Write,
{
    run_with_loader(args, stdout, stderr, &OrthoConfigLoader)
}

fn run_with_loader<I, W, E, L>(args: I, stdout: &mut W, stderr: &mut E, loader: &L) -> ExitCode
where
    I: IntoIterator<Item = OsString>,
    W: Write,
    E: Write,
    L: ConfigLoader,
{
    let args: Vec<OsString> = args.into_iter().collect();
    let split = split_config_arguments(&args);
    let cli = match Cli::try_parse_from(command_arguments(&args, &split)) {
        Ok(cli) => cli,
        Err(error) => return report_usage(&error, stdout, stderr),
    };

    let result = loader
        .load(&split.config_arguments)
        .and_then(|config| execute(cli, &config, stdout));
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            let _ = writeln!(stderr, "{error}");
            ExitCode::FAILURE
        }
    }
}

fn execute<W: Write>(cli: Cli, config: &Config, stdout: &mut W) -> Result<(), AppError> {
    telemetry::initialise(config)?;
    match cli.command {
        CliCommand::Plugin { action } => commands::dispatch(action, config, stdout),
    }
}

/// Prints help, version, or a usage error the way clap would.
fn report_usage<W: Write, E: Write>(
    error: &clap::Error,
    stdout: &mut W,
    stderr: &mut E,
) -> ExitCode {
    let rendered = error.render().to_string();
    if error.use_stderr() {
        let _ = write!(stderr, "{rendered}");
        ExitCode::from(USAGE_EXIT_CODE)
    } else {
        let _ = write!(stdout, "{rendered}");
        ExitCode::SUCCESS
    }
}
