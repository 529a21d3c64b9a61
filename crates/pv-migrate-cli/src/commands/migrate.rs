//! Migrate command implementation.

use pv_migrate::{HelmOverlays, Migrator, ProgressOutput, PvcRef, Request};
use tracing::info;

use crate::cli::{LogFormat, MigrateArgs};
use crate::error::CliError;

/// Migrate command executor.
pub struct MigrateCommand {
    args: MigrateArgs,
    log_format: LogFormat,
}

impl MigrateCommand {
    /// Create a new migrate command.
    #[must_use]
    pub const fn new(args: MigrateArgs, log_format: LogFormat) -> Self {
        Self { args, log_format }
    }

    /// Builds the engine request from the parsed arguments.
    #[must_use]
    pub fn request(&self) -> Request {
        let args = &self.args;
        let source = pvc_ref(
            &args.source,
            args.source_kubeconfig.clone(),
            args.source_context.clone(),
            args.source_namespace.clone(),
            &args.source_path,
        );
        let dest = pvc_ref(
            &args.dest,
            args.dest_kubeconfig.clone(),
            args.dest_context.clone(),
            args.dest_namespace.clone(),
            &args.dest_path,
        );

        let mut request = Request::new(source, dest)
            .with_strategies(args.strategies.iter().map(|s| s.trim().to_string()))
            .with_ignore_mounted(args.ignore_mounted)
            .with_delete_extraneous(args.dest_delete_extraneous_files)
            .with_no_chown(args.no_chown)
            .with_key_algorithm(args.ssh_key_algorithm.into());
        request.show_progress = !args.no_progress_bar;
        request.source_mount_read_only = args.source_mount_read_only;
        request.compress = args.compress;
        request.skip_cleanup = args.skip_cleanup;
        request.dest_host_override = args.dest_host_override.clone();
        request.node_port = args.nodeport_port;
        request.helm_timeout = args.helm_timeout;
        request.helm_binary = args.helm_binary.clone();
        request.lb_svc_timeout = args.lbsvc_timeout;
        request.helm = HelmOverlays {
            values_files: args.helm_values.clone(),
            set: args.helm_set.clone(),
            set_string: args.helm_set_string.clone(),
            set_file: args.helm_set_file.clone(),
        };
        // a progress bar would interleave with json log lines
        request.progress_output = match self.log_format {
            LogFormat::Text => ProgressOutput::Stderr,
            LogFormat::Json => ProgressOutput::Hidden,
        };
        request
    }

    /// Execute the migration.
    ///
    /// # Errors
    ///
    /// Returns the engine's error if the migration fails.
    pub async fn execute(&self) -> Result<(), CliError> {
        let request = self.request();
        info!(
            source = %request.source.name,
            dest = %request.dest.name,
            strategies = ?request.strategies,
            "starting migration"
        );
        Migrator::new().run(request).await?;
        info!("migration completed");
        Ok(())
    }
}

fn pvc_ref(
    name: &str,
    kubeconfig: Option<std::path::PathBuf>,
    context: Option<String>,
    namespace: Option<String>,
    path: &str,
) -> PvcRef {
    let mut pvc = PvcRef::new(name).with_path(path);
    pvc.kubeconfig = kubeconfig;
    pvc.context = context.filter(|c| !c.is_empty());
    pvc.namespace = namespace.filter(|n| !n.is_empty());
    pvc
}
