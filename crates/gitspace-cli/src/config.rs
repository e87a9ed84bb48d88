//! Configuration loading for the `gitspace` CLI.
//!
//! Leading configuration flags are peeled off for `ortho_config`; the rest of
//! the command line goes to the subcommand parser.

use std::ffi::{OsStr, OsString};

use gitspace_config::Config;

use crate::AppError;

/// Flags recognised by the configuration loader.
///
/// Keep in sync with the fields of [`gitspace_config::Config`].
pub(crate) const CONFIG_CLI_FLAGS: &[&str] = &[
    "--config-path",
    "--plugins-dir",
    "--staging-dir",
    "--catalog-owner",
    "--catalog-repo",
    "--catalog-branch",
    "--catalog-raw-base-url",
    "--handshake-timeout-ms",
    "--request-timeout-ms",
    "--shutdown-grace-ms",
    "--install-lock-wait-ms",
    "--http-timeout-ms",
    "--log-filter",
    "--log-format",
];

pub(crate) trait ConfigLoader {
    /// Loads and validates configuration for the CLI.
    ///
    /// Configuration flags must appear before the subcommand; later ones are
    /// handed to the subcommand parser, which rejects them.
    fn load(&self, args: &[OsString]) -> Result<Config, AppError>;
}

pub(crate) struct OrthoConfigLoader;

#[derive(Debug, Clone, Copy)]
enum FlagAction {
    Include { needs_value: bool },
    Skip,
}

impl ConfigLoader for OrthoConfigLoader {
    fn load(&self, args: &[OsString]) -> Result<Config, AppError> {
        let config =
            Config::load_from_iter(args.iter().cloned()).map_err(AppError::LoadConfiguration)?;
        config.validate()?;
        Ok(config)
    }
}

impl OrthoConfigLoader {
    fn process_config_flag(argument: &OsStr) -> FlagAction {
        let argument_text = argument.to_string_lossy();
        if !argument_text.starts_with("--") {
            return FlagAction::Skip;
        }

        let (flag, has_inline_value) = match argument_text.split_once('=') {
            Some((flag, _)) => (flag, true),
            None => (argument_text.as_ref(), false),
        };

        if CONFIG_CLI_FLAGS.contains(&flag) {
            return FlagAction::Include {
                needs_value: !has_inline_value,
            };
        }

        FlagAction::Skip
    }
}

pub(crate) struct ConfigArgumentSplit {
    pub(crate) config_arguments: Vec<OsString>,
    pub(crate) command_start: usize,
}

pub(crate) fn split_config_arguments(args: &[OsString]) -> ConfigArgumentSplit {
    let Some(program) = args.first() else {
        return ConfigArgumentSplit {
            config_arguments: Vec::new(),
            command_start: 0,
        };
    };

    let mut filtered = vec![program.clone()];
    let mut command_start = 1usize;
    let mut pending_value = false;

    for argument in &args[1..] {
        if pending_value {
            filtered.push(argument.clone());
            pending_value = false;
            command_start += 1;
            continue;
        }

        match OrthoConfigLoader::process_config_flag(argument.as_os_str()) {
            FlagAction::Include { needs_value } => {
                filtered.push(argument.clone());
                command_start += 1;
                pending_value = needs_value;
            }
            FlagAction::Skip => break,
        }
    }

    ConfigArgumentSplit {
        config_arguments: filtered,
        command_start,
    }
}

/// Rebuilds the argument list seen by the subcommand parser.
pub(crate) fn command_arguments(args: &[OsString], split: &ConfigArgumentSplit) -> Vec<OsString> {
    let mut cli_arguments: Vec<OsString> = Vec::new();
    if let Some(first) = args.first() {
        cli_arguments.push(first.clone());
    }
    if let Some(rest) = args.get(split.command_start..) {
        cli_arguments.extend(rest.iter().cloned());
    }
    cli_arguments
}
