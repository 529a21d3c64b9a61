//! CLI error types.

use std::fmt;

use pv_migrate::MigrateError;

/// CLI-specific errors.
#[derive(Debug)]
pub enum CliError {
    /// The migration failed.
    Migrate(MigrateError),
    /// Invalid configuration.
    Config(String),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Migrate(e) => write!(f, "{e}"),
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Migrate(e) => Some(e),
            Self::Config(_) => None,
        }
    }
}

impl From<MigrateError> for CliError {
    fn from(err: MigrateError) -> Self {
        Self::Migrate(err)
    }
}
