//! CLI command implementations.
//!
//! - [`migrate`] - Claim migration

pub mod migrate;

pub use migrate::MigrateCommand;
