//! Plugin subcommand handlers.

use std::collections::BTreeMap;
use std::io::Write;

use gitspace_config::Config;
use gitspace_plugins::{
    CatalogIndex, CatalogLocation, CommandResult, ManagerSettings, PluginManager, RemoteFetcher,
    SourceResolver,
};
use tracing::debug;

use crate::cli::PluginAction;
use crate::errors::AppError;

const CLI_TARGET: &str = "gitspace_cli::commands";

/// Runs one plugin subcommand, writing its output to `out`.
pub(crate) fn dispatch<W: Write>(
    action: PluginAction,
    config: &Config,
    out: &mut W,
) -> Result<(), AppError> {
    debug!(target: CLI_TARGET, ?action, plugins_dir = %config.plugins_dir(), "dispatching");
    match action {
        PluginAction::Install { reference } => install(&reference, config, out),
        PluginAction::Uninstall { name } => {
            PluginManager::new(manager_settings(config)).installer().uninstall(&name)?;
            writeln!(out, "uninstalled {name}")?;
            Ok(())
        }
        PluginAction::List => list(config, out),
        PluginAction::Catalog => catalog(config, out),
        PluginAction::Menu { name } => menu(&name, config, out),
        PluginAction::Exec {
            name,
            command,
            args,
        } => exec(&name, &command, args.into_iter().collect(), config, out),
    }
}

pub(crate) fn manager_settings(config: &Config) -> ManagerSettings {
    let mut settings = ManagerSettings::new(config.plugins_dir().clone());
    settings.handshake_timeout = config.handshake_timeout();
    settings.request_timeout = config.request_timeout();
    settings.shutdown_grace = config.shutdown_grace();
    settings.install_lock_wait = config.install_lock_wait();
    settings
}

fn catalog_location(config: &Config) -> CatalogLocation {
    let catalog = config.catalog();
    CatalogLocation {
        owner: catalog.owner,
        repo: catalog.repo,
        branch: catalog.branch,
        raw_base_url: catalog.raw_base_url,
    }
}

fn resolver(config: &Config) -> Result<SourceResolver<RemoteFetcher>, AppError> {
    let location = catalog_location(config);
    let fetcher = RemoteFetcher::new(&location, config.http_timeout())?;
    let resolver = SourceResolver::new(fetcher, location);
    Ok(match config.staging_dir() {
        Some(dir) => resolver.with_staging_dir(dir.as_std_path()),
        None => resolver,
    })
}

fn install<W: Write>(reference: &str, config: &Config, out: &mut W) -> Result<(), AppError> {
    let staged = resolver(config)?.resolve(reference)?;
    let manager = PluginManager::new(manager_settings(config));
    let installed = manager.installer().install(staged)?;
    writeln!(
        out,
        "installed {} {} into {}",
        installed.name(),
        installed.manifest().version(),
        installed.directory().display()
    )?;
    Ok(())
}

fn list<W: Write>(config: &Config, out: &mut W) -> Result<(), AppError> {
    let manager = PluginManager::new(manager_settings(config));
    manager.discover()?;
    let plugins = manager.list_discovered();
    if plugins.is_empty() {
        writeln!(out, "no plugins installed")?;
    }
    for plugin in plugins {
        match plugin.description {
            Some(description) => {
                writeln!(out, "{}\t{}\t{description}", plugin.name, plugin.version)?;
            }
            None => writeln!(out, "{}\t{}", plugin.name, plugin.version)?,
        }
    }
    Ok(())
}

fn catalog<W: Write>(config: &Config, out: &mut W) -> Result<(), AppError> {
    let index = resolver(config)?.catalog()?;
    write_catalog(&index, out)
}

pub(crate) fn write_catalog<W: Write>(index: &CatalogIndex, out: &mut W) -> Result<(), AppError> {
    for (reference, entry) in index.installable_plugins() {
        writeln!(out, "{reference}\t{}\t{}", entry.version, entry.description)?;
    }
    Ok(())
}

fn loaded_manager(name: &str, config: &Config) -> Result<PluginManager, AppError> {
    let manager = PluginManager::new(manager_settings(config));
    manager.discover()?;
    manager.load(name)?;
    Ok(manager)
}

fn menu<W: Write>(name: &str, config: &Config, out: &mut W) -> Result<(), AppError> {
    let manager = loaded_manager(name, config)?;
    for item in manager.get_menu(name)? {
        writeln!(out, "{}\t{}", item.label(), item.command())?;
    }
    Ok(())
}

fn exec<W: Write>(
    name: &str,
    command: &str,
    args: BTreeMap<String, String>,
    config: &Config,
    out: &mut W,
) -> Result<(), AppError> {
    let manager = loaded_manager(name, config)?;
    match manager.execute_command(name, command, args)? {
        CommandResult::Text { text } => writeln!(out, "{text}")?,
        CommandResult::Data { data } => {
            let rendered =
                serde_json::to_string_pretty(&data).map_err(AppError::SerialiseOutput)?;
            writeln!(out, "{rendered}")?;
        }
    }
    Ok(())
}
