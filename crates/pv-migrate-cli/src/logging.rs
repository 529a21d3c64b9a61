//! Tracing subscriber setup.

use std::io;

use tracing_subscriber::EnvFilter;

use crate::cli::LogFormat;
use crate::error::CliError;

/// Builds the filter: `RUST_LOG` when set, else the given level.
///
/// # Errors
///
/// Returns [`CliError::Config`] if `level` is not a valid filter directive.
pub fn filter(level: &str) -> Result<EnvFilter, CliError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(level)
            .map_err(|e| CliError::Config(format!("invalid log level '{level}': {e}"))),
    }
}

/// Installs the global subscriber writing to stderr.
///
/// # Errors
///
/// Returns [`CliError::Config`] for an invalid level or if a subscriber is already set.
pub fn init(level: &str, format: LogFormat) -> Result<(), CliError> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter(level)?)
        .with_writer(io::stderr);
    let result = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    result.map_err(|e| CliError::Config(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_level_names() {
        filter("debug").expect("debug");
        filter("pv_migrate=trace,info").expect("directives");
    }
}
