//! # pv-migrate-cli
//!
//! Command-line interface for the pv-migrate engine.
//!
//! ```text
//! pv-migrate migrate [OPTIONS] <SOURCE> <DEST>
//! ```
//!
//! The binary parses flags into a [`pv_migrate::Request`], sets up logging and runs the
//! [`pv_migrate::Migrator`]. Any engine error ends the process with a failure code.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod commands;
pub mod error;
pub mod logging;

pub use cli::{Cli, Commands, KeyAlgorithmArg, LogFormat, MigrateArgs};
pub use commands::MigrateCommand;
pub use error::CliError;
