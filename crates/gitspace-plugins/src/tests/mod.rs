//! Crate-level integration and BDD tests.

use std::fs;
use std::time::Duration;

use tempfile::TempDir;

use crate::catalog::CatalogLocation;
use crate::fetch::RemoteFetcher;
use crate::manager::{ManagerSettings, PluginManager, PluginState};
use crate::manifest::{MANIFEST_FILE_NAME, PluginManifest, PluginSource};
use crate::protocol::MenuItem;
use crate::resolver::SourceResolver;
use crate::test_support::{ThreadLauncher, scripted};


#[test]
fn local_source_flows_from_resolution_to_menu() {
    let source = TempDir::new().expect("source dir");
    let plugins = TempDir::new().expect("plugins dir");
    let manifest = PluginManifest::new("hello", "1.0.0", vec![PluginSource::new("main", "main")]);
    fs::write(
        source.path().join(MANIFEST_FILE_NAME),
        manifest.to_toml_string().expect("encode manifest"),
    )
    .expect("write manifest");
    fs::write(source.path().join("main"), "#!/bin/sh\n").expect("write entry point");

    let fetcher =
        RemoteFetcher::new(&CatalogLocation::default(), Duration::from_secs(1)).expect("client");
    let resolver = SourceResolver::new(fetcher, CatalogLocation::default());
    let staged = resolver
        .resolve(&source.path().display().to_string())
        .expect("resolve");

    let manager = PluginManager::with_launcher(
        ManagerSettings::new(plugins.path()),
        ThreadLauncher::new(scripted()),
    );
    let installed = manager.installer().install(staged).expect("install");
    assert_eq!(installed.directory(), plugins.path().join("hello"));
    assert!(plugins.path().join("hello/main").is_file());

    assert_eq!(manager.discover().expect("discover"), 1);
    manager.load("hello").expect("load");

    assert_eq!(manager.state("hello"), Some(PluginState::Loaded));
    assert_eq!(
        manager.get_menu("hello").expect("menu"),
        vec![MenuItem::new("Run", "run")]
    );
    assert!(source.path().join(MANIFEST_FILE_NAME).is_file(), "local sources stay in place");
}
