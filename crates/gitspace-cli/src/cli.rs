//! CLI argument definitions for `gitspace`.

use clap::{Parser, Subcommand};

const CONFIGURATION_HELP: &str = "\
Configuration flags go before the subcommand:
  --config-path, --plugins-dir, --staging-dir, --catalog-owner, --catalog-repo,
  --catalog-branch, --catalog-raw-base-url, --handshake-timeout-ms,
  --request-timeout-ms, --shutdown-grace-ms, --install-lock-wait-ms,
  --http-timeout-ms, --log-filter, --log-format
Each can also be set as GITSPACE_<NAME> in the environment or in gitspace.toml.";

/// Command-line interface for the `gitspace` plugin host.
#[derive(Parser, Debug)]
#[command(
    name = "gitspace",
    version,
    disable_help_subcommand = true,
    after_help = CONFIGURATION_HELP
)]
pub(crate) struct Cli {
    /// The action to perform.
    #[command(subcommand)]
    pub(crate) command: CliCommand,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug, Clone)]
pub(crate) enum CliCommand {
    /// Manages and runs plugins.
    Plugin {
        /// The plugin action to perform.
        #[command(subcommand)]
        action: PluginAction,
    },
}

/// Plugin subcommands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub(crate) enum PluginAction {
    /// Installs a plugin from `catalog://NAME`, a git URL, or a local path.
    Install {
        /// Plugin reference.
        reference: String,
    },
    /// Removes an installed plugin.
    Uninstall {
        /// Plugin name.
        name: String,
    },
    /// Lists installed plugins.
    List,
    /// Lists plugins offered by the catalog.
    Catalog,
    /// Prints the menu of a plugin.
    Menu {
        /// Plugin name.
        name: String,
    },
    /// Runs a plugin command.
    Exec {
        /// Plugin name.
        name: String,
        /// Command identifier, as listed by `plugin menu`.
        command: String,
        /// Command argument as KEY=VALUE; may be repeated.
        #[arg(long = "arg", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        args: Vec<(String, String)>,
    },
}

/// Splits `KEY=VALUE` at the first `=`.
pub(crate) fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_owned(), value.to_owned()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}
