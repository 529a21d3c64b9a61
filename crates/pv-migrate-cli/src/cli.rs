//! Command-line argument parsing with clap.

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use pv_migrate::KeyAlgorithm;

/// Lowest port Kubernetes hands out for `NodePort` services by default.
pub const NODE_PORT_MIN: u16 = 30000;
/// Highest port Kubernetes hands out for `NodePort` services by default.
pub const NODE_PORT_MAX: u16 = 32767;

/// pv-migrate - copy the contents of one PersistentVolumeClaim into another.
#[derive(Parser, Debug, Clone)]
#[command(name = "pv-migrate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log level, overridden by `RUST_LOG`.
    #[arg(long, global = true, env = "PV_MIGRATE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log format.
    #[arg(long, global = true, value_enum, env = "PV_MIGRATE_LOG_FORMAT", default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Log output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Migrate the data of one claim into another.
    Migrate(MigrateArgs),
}

/// SSH key algorithms accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum KeyAlgorithmArg {
    /// Ed25519.
    #[default]
    Ed25519,
    /// RSA, 2048 bits.
    Rsa,
}

impl From<KeyAlgorithmArg> for KeyAlgorithm {
    fn from(arg: KeyAlgorithmArg) -> Self {
        match arg {
            KeyAlgorithmArg::Ed25519 => Self::Ed25519,
            KeyAlgorithmArg::Rsa => Self::Rsa,
        }
    }
}

/// Arguments for the migrate command.
#[derive(Args, Debug, Clone)]
#[allow(clippy::struct_excessive_bools)]
pub struct MigrateArgs {
    /// Source claim name.
    pub source: String,

    /// Destination claim name.
    pub dest: String,

    /// Kubeconfig of the source cluster.
    #[arg(short = 'k', long)]
    pub source_kubeconfig: Option<PathBuf>,

    /// Kubeconfig context of the source.
    #[arg(short = 'c', long)]
    pub source_context: Option<String>,

    /// Namespace of the source claim.
    #[arg(short = 'n', long)]
    pub source_namespace: Option<String>,

    /// Path inside the source volume to copy from.
    #[arg(short = 'p', long, default_value = "/")]
    pub source_path: String,

    /// Kubeconfig of the destination cluster.
    #[arg(short = 'K', long)]
    pub dest_kubeconfig: Option<PathBuf>,

    /// Kubeconfig context of the destination.
    #[arg(short = 'C', long)]
    pub dest_context: Option<String>,

    /// Namespace of the destination claim.
    #[arg(short = 'N', long)]
    pub dest_namespace: Option<String>,

    /// Path inside the destination volume to copy into.
    #[arg(short = 'P', long, default_value = "/")]
    pub dest_path: String,

    /// Delete files on the destination that are absent on the source.
    #[arg(short = 'd', long)]
    pub dest_delete_extraneous_files: bool,

    /// Proceed even if a claim is mounted by a running pod.
    #[arg(short = 'i', long)]
    pub ignore_mounted: bool,

    /// Do not preserve file owner and group.
    #[arg(short = 'o', long)]
    pub no_chown: bool,

    /// Do not draw the progress bar.
    #[arg(short = 'b', long)]
    pub no_progress_bar: bool,

    /// Mount the source claim read-only.
    #[arg(long, action = ArgAction::Set, default_value_t = true, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub source_mount_read_only: bool,

    /// Compress data in transit.
    #[arg(long, action = ArgAction::Set, default_value_t = true, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub compress: bool,

    /// Leave the chart releases installed after the run.
    #[arg(long)]
    pub skip_cleanup: bool,

    /// Strategies to try, in order.
    #[arg(short = 's', long, env = "PV_MIGRATE_STRATEGIES", value_delimiter = ',', default_value = "mount,clusterip,lbsvc")]
    pub strategies: Vec<String>,

    /// SSH key algorithm.
    #[arg(short = 'a', long, value_enum, default_value_t = KeyAlgorithmArg::Ed25519)]
    pub ssh_key_algorithm: KeyAlgorithmArg,

    /// Address the rsync side connects to instead of the discovered one.
    #[arg(short = 'H', long)]
    pub dest_host_override: Option<String>,

    /// Fixed node port for the nodeport strategy.
    #[arg(long, value_parser = parse_node_port)]
    pub nodeport_port: Option<u16>,

    /// How long to wait for the load balancer address.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "2m")]
    pub lbsvc_timeout: Duration,

    /// Helm install and uninstall timeout.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1m")]
    pub helm_timeout: Duration,

    /// Helm executable to run.
    #[arg(long, env = "PV_MIGRATE_HELM_BINARY", default_value = "helm")]
    pub helm_binary: PathBuf,

    /// Extra chart values files.
    #[arg(short = 'f', long = "helm-values")]
    pub helm_values: Vec<PathBuf>,

    /// Extra chart values, `key=value`.
    #[arg(long = "helm-set")]
    pub helm_set: Vec<String>,

    /// Extra chart string values, `key=value`.
    #[arg(long = "helm-set-string")]
    pub helm_set_string: Vec<String>,

    /// Extra chart values read from files, `key=path`.
    #[arg(long = "helm-set-file")]
    pub helm_set_file: Vec<String>,
}

/// Parses a node port, rejecting anything outside the service node port range.
///
/// # Errors
///
/// Returns a message naming the allowed range.
pub fn parse_node_port(value: &str) -> Result<u16, String> {
    let port: u16 = value
        .parse()
        .map_err(|_| format!("'{value}' is not a port number"))?;
    if (NODE_PORT_MIN..=NODE_PORT_MAX).contains(&port) {
        Ok(port)
    } else {
        Err(format!(
            "node port {port} is outside the allowed range {NODE_PORT_MIN}-{NODE_PORT_MAX}"
        ))
    }
}
