//! Error type for the CLI runtime.

use std::io;
use std::sync::Arc;

use gitspace_config::{ConfigError, OrthoError};
use gitspace_plugins::{FetchError, InstallError, ManagerError, ResolveError};
use thiserror::Error;

use crate::telemetry::TelemetryError;

#[derive(Debug, Error)]
pub(crate) enum AppError {
    #[error("failed to load configuration: {0}")]
    LoadConfiguration(Arc<OrthoError>),
    #[error("failed to load configuration: {0}")]
    InvalidConfiguration(#[from] ConfigError),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error("failed to prepare the catalog client: {0}")]
    Fetcher(#[from] FetchError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Install(#[from] InstallError),
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error("failed to serialise command output: {0}")]
    SerialiseOutput(serde_json::Error),
    #[error("failed to write output: {0}")]
    WriteOutput(#[from] io::Error),
}
