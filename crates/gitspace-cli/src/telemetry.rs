//! Log output for the `gitspace` CLI.
//!
//! Command results own stdout, so every log line goes to stderr. The filter
//! and format come from [`Config`]; the first successful call to
//! [`initialise`] fixes them for the life of the process.

use std::io::{self, IsTerminal};

use gitspace_config::{Config, LogFormat};
use once_cell::sync::OnceCell;
use tracing::Subscriber;
use tracing::subscriber::SetGlobalDefaultError;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::fmt::{self, MakeWriter};

static SUBSCRIBER_INSTALLED: OnceCell<()> = OnceCell::new();

/// Errors raised while setting up log output.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// `log_filter` is not a valid filter directive list.
    #[error("invalid log filter '{filter}': {source}")]
    Filter {
        /// The rejected expression.
        filter: String,
        /// Parser diagnostic.
        #[source]
        source: ParseError,
    },
    /// Another global subscriber was installed first.
    #[error("failed to install log subscriber: {0}")]
    Subscriber(#[from] SetGlobalDefaultError),
}

/// Installs the stderr log subscriber described by `config`.
///
/// Calls after the first successful one are no-ops.
///
/// # Errors
///
/// Returns [`TelemetryError::Filter`] for an unparsable `log_filter` and
/// [`TelemetryError::Subscriber`] when some other global subscriber is
/// already in place.
pub fn initialise(config: &Config) -> Result<(), TelemetryError> {
    SUBSCRIBER_INSTALLED
        .get_or_try_init(|| {
            let subscriber = build_subscriber(config, io::stderr, io::stderr().is_terminal())?;
            tracing::subscriber::set_global_default(subscriber)?;
            Ok::<(), TelemetryError>(())
        })
        .copied()
}

/// Builds the subscriber for `config` writing to `writer`.
///
/// Colour codes are emitted only when `ansi` is set.
pub(crate) fn build_subscriber<W>(
    config: &Config,
    writer: W,
    ansi: bool,
) -> Result<Box<dyn Subscriber + Send + Sync>, TelemetryError>
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    let filter = EnvFilter::try_new(config.log_filter()).map_err(|source| {
        TelemetryError::Filter {
            filter: config.log_filter().to_owned(),
            source,
        }
    })?;

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(writer)
        .with_ansi(ansi)
        .with_timer(fmt::time::UtcTime::rfc_3339());

    Ok(match config.log_format() {
        LogFormat::Json => Box::new(builder.json().flatten_event(true).finish()),
        LogFormat::Compact => Box::new(builder.compact().finish()),
    })
}
